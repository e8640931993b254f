use super::*;

fn double() -> ConcreteType {
    ConcreteType::DOUBLE
}

#[test]
fn scalar_lattice() {
    use ConcreteType::*;

    // meet agrees on equal and defers on Unknown/Anything
    assert_eq!(Integer.and_in(Integer).unwrap(), Integer);
    assert_eq!(Unknown.and_in(double()).unwrap(), double());
    assert_eq!(double().and_in(Unknown).unwrap(), double());
    assert_eq!(Anything.and_in(Pointer).unwrap(), Pointer);
    assert_eq!(Pointer.and_in(Anything).unwrap(), Pointer);
    assert!(Integer.and_in(Pointer).is_err());
    assert!(double().and_in(Integer).is_err());

    // join absorbs into the top but never silently widens a contradiction
    assert_eq!(Integer.or_in(Integer).unwrap(), Integer);
    assert_eq!(Unknown.or_in(Pointer).unwrap(), Pointer);
    assert_eq!(Anything.or_in(Integer).unwrap(), Anything);
    assert_eq!(double().or_in(Anything).unwrap(), Anything);
    assert!(Integer.or_in(double()).is_err());
    assert!(Pointer.or_in(Integer).is_err());
}

#[test]
fn or_in_is_monotone() {
    use ConcreteType::*;
    // Any compatible sequence of joins never loses information: each step
    // keeps the domain of the previous tree and only moves entries upward.
    let mut deep = TypeTree::scalar(double()).only(0);
    deep.or_in(&TypeTree::scalar(Integer).only(8)).unwrap();
    let steps = [
        TypeTree::scalar(Integer),
        deep,
        TypeTree::scalar(Anything),
        TypeTree::pointer_to(Anything),
    ];
    let mut acc = TypeTree::new();
    let mut seen_paths = 0;
    for step in &steps {
        let before = acc.clone();
        acc.or_in(step).unwrap();
        assert!(acc.iter().count() >= seen_paths, "entries disappeared");
        seen_paths = acc.iter().count();
        for (path, ct) in before.iter() {
            let now = acc.iter().find(|(p, _)| *p == path).unwrap().1;
            // moved up or stayed
            assert_eq!(now.or_in(ct).unwrap(), now);
        }
        // a second application changes nothing (fixpoint per step)
        let mut again = acc.clone();
        assert!(!again.or_in(step).unwrap());
    }
}

#[test]
fn and_in_conflicts() {
    let mut lhs = TypeTree::scalar(ConcreteType::Integer);
    let rhs = TypeTree::scalar(double());
    assert!(lhs.and_in(&rhs).is_err());

    let mut lhs = TypeTree::scalar(ConcreteType::Anything);
    assert!(lhs.and_in(&rhs).unwrap());
    assert_eq!(lhs.data0(), double());
}

#[test]
fn only_wraps_paths() {
    let tree = TypeTree::pointer_to(double()).only(8);
    let entries: Vec<_> = tree.iter().collect();
    assert_eq!(entries, vec![(&[8][..], ConcreteType::Pointer), (&[8, UNIFORM][..], double())]);
}

#[test]
fn shift_selects_and_relabels() {
    let mut tree = TypeTree::scalar(ConcreteType::Pointer);
    tree.or_in(&TypeTree::scalar(double()).only(0)).unwrap();
    tree.or_in(&TypeTree::scalar(ConcreteType::Integer).only(8)).unwrap();
    tree.or_in(&TypeTree::scalar(double()).only(16)).unwrap();

    // drop the first slot, relabel the rest to zero
    let shifted = tree.shift_indices(8, -1, 0);
    assert_eq!(shifted.at_offset(0), ConcreteType::Integer);
    assert_eq!(shifted.at_offset(8), double());
    // the scalar classification of the value itself does not survive
    assert_eq!(shifted.data0(), ConcreteType::Unknown);

    // a bounded selection drops offsets past the window
    let windowed = tree.shift_indices(0, 16, 0);
    assert_eq!(windowed.at_offset(0), double());
    assert_eq!(windowed.at_offset(8), ConcreteType::Integer);
    assert_eq!(windowed.at_offset(16), ConcreteType::Unknown);
}

#[test]
fn shift_downgrades_uniform() {
    let tree = TypeTree::pointer_to(double());

    // shifting by zero with no bound keeps the wildcard
    let kept = tree.shift_indices(0, -1, 0);
    assert_eq!(kept.at_offset(123), double());

    // a bounded shift expands it to concrete offsets
    let expanded = tree.shift_indices(0, 16, 0);
    let paths: Vec<_> = expanded.iter().map(|(p, _)| p.to_vec()).collect();
    assert_eq!(paths, vec![vec![0], vec![8]]);

    // an unbounded nonzero shift drops it
    let dropped = tree.shift_indices(8, -1, 0);
    assert!(dropped.is_empty());
}

#[test]
fn lookup_projects_pointee() {
    let mut ptr = TypeTree::scalar(ConcreteType::Pointer);
    ptr.or_in(&TypeTree::scalar(double()).only(0)).unwrap();
    ptr.or_in(&TypeTree::scalar(ConcreteType::Integer).only(8)).unwrap();

    let loaded = ptr.lookup(SLOT);
    assert_eq!(loaded.data0(), double());
    // the second slot is beyond the loaded byte range
    assert_eq!(loaded.iter().count(), 1);

    // uniform pointee entries apply to the loaded slot too
    let uniform = TypeTree::pointer_to(double()).lookup(SLOT);
    assert_eq!(uniform.data0(), double());
}

#[test]
fn lookup_of_pointer_to_pointer() {
    // p -> q -> double: loading p yields a pointer-to-double
    let mut p = TypeTree::scalar(ConcreteType::Pointer);
    p.or_in(&TypeTree::pointer_to(double()).only(0)).unwrap();

    let q = p.lookup(SLOT);
    assert_eq!(q.data0(), ConcreteType::Pointer);
    assert_eq!(q.at_offset(4), double());
}

#[test]
fn purge_anything_unmasks() {
    let mut tree = TypeTree::scalar(ConcreteType::Anything);
    tree.or_in(&TypeTree::scalar(double()).only(0)).unwrap();
    let purged = tree.purge_anything();
    assert_eq!(purged.data0(), ConcreteType::Unknown);
    assert_eq!(purged.at_offset(0), double());
}

#[test]
fn keep_minus_one_and_at_most() {
    let mut tree = TypeTree::pointer_to(double());
    tree.or_in(&TypeTree::scalar(ConcreteType::Integer).only(24)).unwrap();

    let uniform = tree.keep_minus_one();
    assert_eq!(uniform.iter().count(), 1);
    assert_eq!(uniform.at_offset(7), double());

    let bounded = tree.at_most(16);
    assert_eq!(bounded.at_offset(24), double()); // only through the wildcard
    assert!(bounded.iter().all(|(path, _)| path.first() != Some(&24)));
}

#[test]
fn clear_and_canonicalize() {
    let tree = TypeTree::pointer_to(double());
    let canon = tree.canonicalize_value(24);
    let paths: Vec<_> = canon.iter().map(|(p, _)| p.to_vec()).collect();
    assert_eq!(paths, vec![vec![], vec![0], vec![8], vec![16]]);

    let cleared = tree.clear(8, 16, 24);
    assert_eq!(cleared.at_offset(0), double());
    assert_eq!(cleared.at_offset(8), ConcreteType::Unknown);
    assert_eq!(cleared.at_offset(16), double());
}

#[test]
fn keep_for_cast_replaces_surface() {
    let mut tree = TypeTree::scalar(ConcreteType::Anything);
    tree.or_in(&TypeTree::scalar(ConcreteType::Integer).only(0)).unwrap();

    let cast = tree.keep_for_cast(double());
    assert_eq!(cast.data0(), double());
    // payload bits survive
    assert_eq!(cast.at_offset(0), ConcreteType::Integer);

    // a concrete surface type that contradicts the destination is pruned
    let int = TypeTree::scalar(ConcreteType::Integer);
    assert_eq!(int.keep_for_cast(double()).data0(), ConcreteType::Unknown);
}
