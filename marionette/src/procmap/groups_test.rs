use super::{GroupSpec, ProcMapError};

#[test]
pub fn parse_sized_and_bare() {
    let spec = GroupSpec::parse(&["world=2", "analysis"], 6, &[]).unwrap();
    assert_eq!(spec, GroupSpec::new([("world", 2), ("analysis", 4)]));
    assert_eq!(spec.total(), 6);
}

#[test]
pub fn parse_fills_unmentioned_groups() {
    let spec = GroupSpec::parse(&["sim=3"], 8, &["sim", "a", "b"]).unwrap();
    assert_eq!(spec, GroupSpec::new([("sim", 3), ("a", 2), ("b", 3)]));
}

#[test]
pub fn parse_rejects_bad_entries() {
    assert_eq!(
        GroupSpec::parse(&["a=5", "b=2"], 6, &[]),
        Err(ProcMapError::OverSubscribed {
            requested: 7,
            available: 6
        })
    );
    assert_eq!(
        GroupSpec::parse(&["a=x"], 6, &[]),
        Err(ProcMapError::InvalidEntry("a=x".to_string()))
    );
    assert_eq!(
        GroupSpec::parse(&["a", "a"], 6, &[]),
        Err(ProcMapError::DuplicateGroup("a".to_string()))
    );
    assert_eq!(
        GroupSpec::parse(&["a,b=2", "c"], 4, &[]),
        Err(ProcMapError::InvalidEntry("a,b".to_string()))
    );
}

#[test]
pub fn resolve_rejects_names_that_break_the_wire_form() {
    assert_eq!(
        GroupSpec::resolve(&[("a,b", 1), ("c", 1)], 2),
        Err(ProcMapError::InvalidEntry("a,b".to_string()))
    );
    assert_eq!(
        GroupSpec::resolve(&[("x=1", 0)], 2),
        Err(ProcMapError::InvalidEntry("x=1".to_string()))
    );
    assert_eq!(
        GroupSpec::resolve(&[("", 2)], 2),
        Err(ProcMapError::InvalidEntry(String::new()))
    );
}

#[test]
pub fn resolve_gives_remainder_to_last() {
    let spec = GroupSpec::resolve(&[("a", 1), ("b", 0), ("c", -1)], 6).unwrap();
    assert_eq!(spec, GroupSpec::new([("a", 1), ("b", 2), ("c", 3)]));

    let single = GroupSpec::resolve(&[("world", 0)], 4).unwrap();
    assert_eq!(single, GroupSpec::new([("world", 4)]));
}

#[test]
pub fn wire_form() {
    let spec = GroupSpec::new([("a", 2), ("b", 2)]);
    assert_eq!(spec.to_wire(), "a=2,b=2");
    assert_eq!(GroupSpec::from_wire("a=2,b=2"), Ok(spec));
    assert_eq!(GroupSpec::from_wire(""), Ok(GroupSpec::default()));
    assert!(GroupSpec::from_wire("a").is_err());
}
