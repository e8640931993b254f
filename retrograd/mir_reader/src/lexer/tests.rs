use super::*;

fn tokens(src: &str) -> Vec<Token> {
    let mut lex = Lexer::new(src);
    let mut res = Vec::new();
    while let Some(tok) = lex.next() {
        res.push(tok.unwrap().token);
    }
    res
}

#[test]
fn entities_and_punctuation() {
    assert_eq!(
        tokens("v1 = fadd v2, v3"),
        vec![
            Token::Value(Value::with_number(1).unwrap()),
            Token::Equal,
            Token::Identifier("fadd"),
            Token::Value(Value::with_number(2).unwrap()),
            Token::Comma,
            Token::Value(Value::with_number(3).unwrap()),
        ]
    );
    assert_eq!(
        tokens("block7: jmp block8"),
        vec![
            Token::Block(Block::with_number(7).unwrap()),
            Token::Colon,
            Token::Identifier("jmp"),
            Token::Block(Block::with_number(8).unwrap()),
        ]
    );
    assert_eq!(tokens("fn0 -> %f.grad"), vec![
        Token::FuncRef(0),
        Token::Arrow,
        Token::Name("f.grad"),
    ]);
}

#[test]
fn numbers() {
    assert_eq!(tokens("42 -7"), vec![Token::Integer("42"), Token::Integer("-7")]);
    assert_eq!(
        tokens("0.0 0x1.8000000000000p1 -Inf NaN"),
        vec![
            Token::Float("0.0"),
            Token::Float("0x1.8000000000000p1"),
            Token::Float("-Inf"),
            Token::Float("NaN"),
        ]
    );
}

#[test]
fn comments_and_lines() {
    let mut lex = Lexer::new("v1 ; trailing\n// whole line\nv2");
    assert_eq!(lex.next().unwrap().unwrap().location.line_number, 1);
    assert!(matches!(lex.next().unwrap().unwrap().token, Token::Comment(_)));
    assert!(matches!(lex.next().unwrap().unwrap().token, Token::Comment(_)));
    let LocatedToken { token, location } = lex.next().unwrap().unwrap();
    assert_eq!(token, Token::Value(Value::with_number(2).unwrap()));
    assert_eq!(location.line_number, 3);
}

#[test]
fn leading_zeros_are_not_entities() {
    assert_eq!(split_entity_name("v01"), None);
    assert_eq!(split_entity_name("v10"), Some(("v", 10)));
    assert_eq!(tokens("v01"), vec![Token::Identifier("v01")]);
}
