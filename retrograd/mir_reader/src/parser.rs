//! Parser for the textual MIR format.

use mir::{
    Block, FuncRef, Function, FunctionSignature, Ieee64, InstructionData, InstructionFormat,
    Opcode, Param, PhiNode, SourceLoc, Value, ValueList,
};

use crate::error::{err, Location, ParseResult};
use crate::lexer::{LexError, Lexer, LocatedError, LocatedToken, Token};
use crate::ParseError;

#[cfg(test)]
mod tests;

/// After some quick benchmarks a program should never have more than 100,000
/// blocks.
const MAX_BLOCKS_IN_A_FUNCTION: u32 = 100_000;

/// Parse the entire `text` into a list of functions.
pub fn parse_functions(text: &str) -> ParseResult<Vec<Function>> {
    Parser::new(text).parse_function_list()
}

/// Parse the entire `text` into a single function.
pub fn parse_function(text: &str) -> ParseResult<Function> {
    Parser::new(text).parse_function()
}

pub struct Parser<'a> {
    lex: Lexer<'a>,

    lex_error: Option<LexError>,

    /// Current lookahead token.
    lookahead: Option<Token<'a>>,

    /// Location of lookahead.
    loc: Location,
}

/// Context for resolving references when parsing a single function.
struct Context {
    function: Function,
}

impl Context {
    fn new(f: Function) -> Self {
        Self { function: f }
    }

    // Allocate a signature slot.
    fn add_sig(&mut self, sig: FuncRef, data: FunctionSignature) -> ParseResult<()> {
        while usize::from(self.function.dfg.signatures.next_key()) <= usize::from(sig) {
            self.function.import_function(FunctionSignature::default());
        }
        self.function.dfg.signatures[sig] = data;
        Ok(())
    }

    // Allocate and insert a new block.
    fn add_block(&mut self, block: Block) -> ParseResult<Block> {
        while self.function.layout.num_blocks() <= usize::from(block) {
            self.function.layout.make_block();
        }
        self.function.layout.append_block(block);
        Ok(block)
    }
}

impl<'a> Parser<'a> {
    /// Create a new `Parser` which reads `text`.
    pub fn new(text: &'a str) -> Self {
        Self {
            lex: Lexer::new(text),
            lex_error: None,
            lookahead: None,
            loc: Location { line_number: 0 },
        }
    }

    // Consume the current lookahead token and return it.
    fn consume(&mut self) -> Token<'a> {
        self.lookahead.take().expect("no token to consume")
    }

    // Get the current lookahead token, after making sure there is one.
    // Comments are skipped.
    fn token(&mut self) -> Option<Token<'a>> {
        while self.lookahead.is_none() {
            match self.lex.next() {
                Some(Ok(LocatedToken { token: Token::Comment(_), .. })) => continue,
                Some(Ok(LocatedToken { token, location })) => {
                    self.lookahead = Some(token);
                    self.loc = location;
                }
                Some(Err(LocatedError { error, location })) => {
                    self.lex_error = Some(error);
                    self.loc = location;
                    break;
                }
                None => break,
            }
        }
        self.lookahead
    }

    // Match and consume a token without payload.
    fn match_token(&mut self, want: Token<'a>, err_msg: &str) -> ParseResult<Token<'a>> {
        if self.token() == Some(want) {
            Ok(self.consume())
        } else {
            err!(self.loc, err_msg)
        }
    }

    // If the next token is a `want`, consume it, otherwise do nothing.
    fn optional(&mut self, want: Token<'a>) -> bool {
        if self.token() == Some(want) {
            self.consume();
            true
        } else {
            false
        }
    }

    // Match and consume a specific identifier string. Used for
    // pseudo-keywords like "function" that only appear in certain contexts.
    fn match_identifier(&mut self, want: &'static str, err_msg: &str) -> ParseResult<Token<'a>> {
        if self.token() == Some(Token::Identifier(want)) {
            Ok(self.consume())
        } else {
            err!(self.loc, err_msg)
        }
    }

    // Match and consume a function reference.
    fn match_fn(&mut self, err_msg: &str) -> ParseResult<FuncRef> {
        if let Some(Token::FuncRef(fnref)) = self.token() {
            self.consume();
            if let Some(fnref) = FuncRef::with_number(fnref) {
                return Ok(fnref);
            }
        }
        err!(self.loc, err_msg)
    }

    // Match and consume a block reference.
    fn match_block(&mut self, err_msg: &str) -> ParseResult<Block> {
        if let Some(Token::Block(block)) = self.token() {
            self.consume();
            Ok(block)
        } else {
            err!(self.loc, err_msg)
        }
    }

    // Match and consume a value reference, padding the value table as
    // needed.
    fn match_value(&mut self, ctx: &mut Context, err_msg: &str) -> ParseResult<Value> {
        if let Some(Token::Value(v)) = self.token() {
            while ctx.function.dfg.num_values() <= usize::from(v) {
                ctx.function.dfg.make_invalid_value();
            }

            self.consume();
            Ok(v)
        } else {
            err!(self.loc, err_msg)
        }
    }

    fn error(&self, message: &str) -> ParseError {
        ParseError { location: self.loc, message: message.to_string(), is_warning: false }
    }

    // Match and consume an i32 immediate.
    fn match_imm(&mut self, err_msg: &str) -> ParseResult<i32> {
        if let Some(Token::Integer(text)) = self.token() {
            self.consume();
            let negative = text.starts_with('-');
            let positive = text.starts_with('+');
            let text = if negative || positive { &text[1..] } else { text };

            let value = if let Some(hex) = text.strip_prefix("0x") {
                // Skip underscores and parse it in hexadecimal form.
                let hex = hex.replace('_', "");
                u32::from_str_radix(&hex, 16)
                    .map_err(|_| self.error("unable to parse value as a hexadecimal immediate"))?
            } else {
                // Parse decimal as u32 so the sign can be applied uniformly.
                text.parse().map_err(|_| self.error("expected decimal immediate"))?
            };

            let signed = if negative {
                let value = value.wrapping_neg() as i32;
                if value > 0 {
                    return Err(self.error("negative number too small"));
                }
                value
            } else {
                value as i32
            };

            Ok(signed)
        } else {
            err!(self.loc, err_msg)
        }
    }

    // Match and consume an Ieee64 immediate.
    fn match_ieee64(&mut self, err_msg: &str) -> ParseResult<Ieee64> {
        if let Some(Token::Float(text)) = self.token() {
            self.consume();
            // The lexer gives us raw text that looks like a float; parse it
            // as an Ieee64 to check the number of digits and other issues.
            text.parse().map_err(|e: &str| self.error(e))
        } else {
            err!(self.loc, err_msg)
        }
    }

    /// Parse an optional source location.
    fn optional_srcloc(&mut self) -> ParseResult<SourceLoc> {
        if let Some(Token::SourceLoc(text)) = self.token() {
            match i32::from_str_radix(text, 16) {
                Ok(num) => {
                    self.consume();
                    Ok(SourceLoc::new(num))
                }
                Err(_) => err!(self.loc, "invalid source location: {}", text),
            }
        } else {
            Ok(Default::default())
        }
    }

    /// Parse a list of function definitions.
    ///
    /// This is the top-level parse function matching the whole contents of a
    /// file.
    pub fn parse_function_list(&mut self) -> ParseResult<Vec<Function>> {
        let mut list = Vec::new();
        while self.token().is_some() {
            list.push(self.parse_function()?);
        }
        if let Some(err) = self.lex_error {
            return match err {
                LexError::InvalidChar => err!(self.loc, "invalid character"),
            };
        }
        Ok(list)
    }

    // Parse a whole function definition.
    //
    // function ::= * "function" name "(" params ")" "{" preamble
    //              function-body "}"
    pub fn parse_function(&mut self) -> ParseResult<Function> {
        self.match_identifier("function", "expected 'function'")?;

        let name = self.parse_external_name()?;

        let mut ctx = Context::new(Function::with_name(name));
        self.parse_func_params(&mut ctx)?;

        self.match_token(Token::LBrace, "expected '{' before function body")?;
        self.parse_preamble(&mut ctx)?;
        self.parse_function_body(&mut ctx)?;
        self.match_token(Token::RBrace, "expected '}' after function body")?;

        Ok(ctx.function)
    }

    // Parse the function preamble: signature declarations and constant
    // definitions.
    //
    // preamble      ::= * { preamble-decl }
    // preamble-decl ::= FuncRef "=" signature
    //                 | Value "=" ("fconst" | "iconst") imm
    fn parse_preamble(&mut self, ctx: &mut Context) -> ParseResult<()> {
        loop {
            match self.token() {
                Some(Token::FuncRef(..)) => {
                    self.parse_signature_decl().and_then(|(fn_, dat)| ctx.add_sig(fn_, dat))
                }
                Some(Token::Value(dst)) => {
                    // The body always starts with a block header, so a value
                    // here can only open a constant definition.
                    while ctx.function.dfg.num_values() <= usize::from(dst) {
                        ctx.function.dfg.make_invalid_value();
                    }
                    self.consume();
                    self.match_token(
                        Token::Equal,
                        "expected '=' between constant definition and value",
                    )?;

                    match self.token() {
                        Some(Token::Identifier("fconst")) => {
                            self.consume();
                            let val = self.match_ieee64("expected float value")?;
                            ctx.function.dfg.values.fconst_at(val, dst)
                        }
                        Some(Token::Identifier("iconst")) => {
                            self.consume();
                            let val = self.match_imm("expected int value")?;
                            ctx.function.dfg.values.iconst_at(val, dst)
                        }
                        _ => {
                            return err!(
                                self.loc,
                                "expected 'fconst', 'iconst' or function signature"
                            )
                        }
                    }

                    Ok(())
                }
                _ => return Ok(()),
            }?;
        }
    }

    // Parse an external name.
    fn parse_external_name(&mut self) -> ParseResult<String> {
        match self.token() {
            Some(Token::Name(s)) => {
                self.consume();
                Ok(s.to_owned())
            }
            _ => err!(self.loc, "expected external name"),
        }
    }

    // Parse a function signature.
    //
    // signature ::= ["const"] "fn" name "(" argcount ")" ["->" retcount]
    fn parse_signature(&mut self) -> ParseResult<FunctionSignature> {
        let has_sideeffects = !self.optional(Token::Identifier("const"));
        self.match_identifier("fn", "expected 'fn'")?;

        let mut sig = FunctionSignature {
            name: self.parse_external_name()?,
            params: 0,
            returns: 0,
            has_sideeffects,
        };

        self.match_token(Token::LPar, "expected function signature: ( args... )")?;
        sig.params = self.match_imm("expected integer")? as u16;
        self.match_token(Token::RPar, "expected ')' after function arguments")?;
        if self.optional(Token::Arrow) {
            sig.returns = self.match_imm("expected integer")? as u16;
        }

        Ok(sig)
    }

    // Parse a signature decl.
    //
    // signature-decl ::= FuncRef(fnref) "=" signature
    fn parse_signature_decl(&mut self) -> ParseResult<(FuncRef, FunctionSignature)> {
        let sig = self.match_fn("expected signature number: fn«n»")?;
        self.match_token(Token::Equal, "expected '=' in signature decl")?;
        let data = self.parse_signature()?;
        Ok((sig, data))
    }

    // Parse a function body, add contents to `ctx`.
    //
    // function-body ::= * { basic-block }
    fn parse_function_body(&mut self, ctx: &mut Context) -> ParseResult<()> {
        while self.token() != Some(Token::RBrace) {
            self.parse_basic_block(ctx)?;
        }

        Ok(())
    }

    // Parse a basic block, add contents to `ctx`.
    //
    // basic-block ::= * block-header { instruction }
    // block-header ::= Block(block) ":"
    fn parse_basic_block(&mut self, ctx: &mut Context) -> ParseResult<()> {
        let block_num = self.match_block("expected block header")?;
        let block = ctx.add_block(block_num)?;

        if u32::from(block_num) >= MAX_BLOCKS_IN_A_FUNCTION {
            return Err(self.error("too many blocks"));
        }

        self.match_token(Token::Colon, "expected ':' after block header")?;

        while matches!(
            self.token(),
            Some(Token::Value(_) | Token::Identifier(_) | Token::SourceLoc(_))
        ) {
            let srcloc = self.optional_srcloc()?;
            let results = self.parse_inst_results(ctx)?;

            match self.token() {
                Some(Token::Equal) => {
                    self.consume();
                    self.parse_instruction(&results, srcloc, ctx, block)?;
                }
                _ if !results.is_empty() => return err!(self.loc, "expected '='"),
                _ => self.parse_instruction(&results, srcloc, ctx, block)?,
            }
        }

        Ok(())
    }

    // Parse parenthesized list of function parameters.
    //
    // params ::= * "(" [ Value { "," Value } ] ")"
    fn parse_func_params(&mut self, ctx: &mut Context) -> ParseResult<()> {
        self.match_token(Token::LPar, "expected '('")?;
        let mut i = 0u32;
        if self.token() != Some(Token::RPar) {
            loop {
                self.parse_function_param(ctx, i.into())?;
                i += 1;

                if !self.optional(Token::Comma) {
                    break;
                }
            }
        }

        self.match_token(Token::RPar, "expected ')'")?;

        Ok(())
    }

    // Parse a single function parameter declaration.
    fn parse_function_param(&mut self, ctx: &mut Context, param: Param) -> ParseResult<()> {
        let v = self.match_value(ctx, "function parameter must be a value")?;
        ctx.function.dfg.values.make_param_at(param, v);
        Ok(())
    }

    // Parse instruction results and return them.
    //
    // inst-results ::= Value(v) { "," Value(v) }
    fn parse_inst_results(&mut self, ctx: &mut Context) -> ParseResult<Vec<Value>> {
        let mut results = Vec::new();

        if let Ok(v) = self.match_value(ctx, "") {
            results.push(v);

            while self.optional(Token::Comma) {
                results.push(self.match_value(ctx, "expected result value")?);
            }
        }

        Ok(results)
    }

    // Parse an instruction, append it to `block`.
    //
    // instruction ::= [inst-results "="] Opcode(opc) operands
    fn parse_instruction(
        &mut self,
        results: &[Value],
        srcloc: SourceLoc,
        ctx: &mut Context,
        block: Block,
    ) -> ParseResult<()> {
        let opcode = if let Some(Token::Identifier(text)) = self.token() {
            match text.parse() {
                Ok(opc) => opc,
                Err(msg) => return err!(self.loc, "{}: '{}'", msg, text),
            }
        } else {
            return err!(self.loc, "expected instruction opcode");
        };
        self.consume();

        let inst_data = self.parse_inst_operands(ctx, opcode)?;

        // We're done parsing the instruction. We still need to check that
        // the number of result values in the source matches the opcode or
        // function call signature, reusing the values given in the source.
        let inst = ctx.function.dfg.make_inst(inst_data);
        let num_results =
            ctx.function.dfg.make_inst_results_reusing(inst, results.iter().map(|x| Some(*x)));
        ctx.function.layout.append_inst_to_bb(inst, block);
        ctx.function.srclocs_set(inst, srcloc);

        if results.len() != num_results {
            return err!(
                self.loc,
                "instruction produces {} result values, {} given",
                num_results,
                results.len()
            );
        }

        Ok(())
    }

    // Parse comma-separated value list.
    //
    // value_list ::= [ value { "," value } ]
    fn parse_value_list(&mut self, ctx: &mut Context) -> ParseResult<Vec<Value>> {
        let mut args = Vec::new();

        if let Ok(v) = self.match_value(ctx, "") {
            args.push(v);
        } else {
            return Ok(args);
        }

        while self.optional(Token::Comma) {
            args.push(self.match_value(ctx, "expected value in argument list")?);
        }

        Ok(args)
    }

    fn into_value_list(&mut self, args: Vec<Value>, ctx: &mut Context) -> ValueList {
        let mut list = ValueList::new();
        list.extend(args, &mut ctx.function.dfg.insts.pools.value_lists);
        list
    }

    // Parse the operands following the instruction opcode. This depends on
    // the format of the opcode.
    fn parse_inst_operands(
        &mut self,
        ctx: &mut Context,
        opcode: Opcode,
    ) -> ParseResult<InstructionData> {
        let idata = match opcode.format() {
            InstructionFormat::Unary => InstructionData::Unary {
                opcode,
                arg: self.match_value(ctx, "expected SSA value operand")?,
            },
            InstructionFormat::Binary => {
                let lhs = self.match_value(ctx, "expected SSA value first operand")?;
                self.match_token(Token::Comma, "expected ',' between operands")?;
                let rhs = self.match_value(ctx, "expected SSA value second operand")?;
                InstructionData::Binary { opcode, args: [lhs, rhs] }
            }
            InstructionFormat::Ternary => {
                let a = self.match_value(ctx, "expected SSA value first operand")?;
                self.match_token(Token::Comma, "expected ',' between operands")?;
                let b = self.match_value(ctx, "expected SSA value second operand")?;
                self.match_token(Token::Comma, "expected ',' between operands")?;
                let c = self.match_value(ctx, "expected SSA value third operand")?;
                InstructionData::Ternary { opcode, args: [a, b, c] }
            }
            InstructionFormat::Jump => {
                let block_num = self.match_block("expected jump destination block")?;
                InstructionData::Jump { destination: block_num }
            }
            // br <COND>, <THEN_DST>, <ELSE_DST>
            InstructionFormat::Branch => {
                let cond = self.match_value(ctx, "expected SSA value control operand")?;
                self.match_token(Token::Comma, "expected ',' between operands")?;
                let then_dst = self.match_block("expected branch destination block")?;
                self.match_token(Token::Comma, "expected ',' between operands")?;
                let else_dst = self.match_block("expected branch destination block")?;
                InstructionData::Branch { cond, then_dst, else_dst }
            }
            InstructionFormat::Call => {
                let func_ref = self.match_fn("expected function reference")?;
                self.match_token(Token::LPar, "expected '(' before arguments")?;
                let args = self.parse_value_list(ctx)?;
                self.match_token(Token::RPar, "expected ')' after arguments")?;
                let args = self.into_value_list(args, ctx);
                InstructionData::Call { func_ref, args }
            }
            InstructionFormat::Ret => {
                let args = self.parse_value_list(ctx)?;
                let args = self.into_value_list(args, ctx);
                InstructionData::Ret { args }
            }
            InstructionFormat::PhiNode => {
                let mut args = ValueList::new();
                let mut blocks = mir::BlockList::new();
                loop {
                    let (val, block) = self.parse_phi_edge(ctx)?;
                    args.push(val, &mut ctx.function.dfg.insts.pools.value_lists);
                    blocks.push(block, &mut ctx.function.dfg.insts.pools.block_lists);
                    if !self.optional(Token::Comma) {
                        break;
                    }
                }

                InstructionData::PhiNode(PhiNode { args, blocks })
            }
            InstructionFormat::Unreachable => InstructionData::Unreachable,
        };
        Ok(idata)
    }

    fn parse_phi_edge(&mut self, ctx: &mut Context) -> ParseResult<(Value, Block)> {
        self.match_token(Token::LBracket, "expected '['")?;
        let val = self.match_value(ctx, "expected phi value")?;
        self.match_token(Token::Comma, "expected ',' between phi value and block")?;
        let block = self.match_block("expected phi block")?;
        self.match_token(Token::RBracket, "expected ']' to end phi edge")?;
        Ok((val, block))
    }
}
