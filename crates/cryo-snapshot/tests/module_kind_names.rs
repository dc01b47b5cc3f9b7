use cryo_snapshot::ModuleKind;

#[test]
fn module_kinds_have_stable_names_and_numbers() {
    let cases = [
        (ModuleKind::FILTER, 1u32, "FILTER"),
        (ModuleKind::WRITER, 2u32, "WRITER"),
        (ModuleKind::MISC, 3u32, "MISC"),
        (ModuleKind::MISC_HIDDEN, 4u32, "MISC_HIDDEN"),
    ];

    for (kind, expected_num, expected_name) in cases {
        assert_eq!(
            kind.0, expected_num,
            "{expected_name} ModuleKind number changed; headers on disk rely on it"
        );
        assert_eq!(kind.name(), Some(expected_name));
        assert_eq!(format!("{kind}"), format!("{expected_name}({expected_num})"));
    }

    assert_eq!(ModuleKind(99).name(), None);
    assert_eq!(format!("{}", ModuleKind(99)), "UNKNOWN(99)");
}
