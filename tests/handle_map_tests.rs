//! Handle-map wire format and transport

use hexsh::platform::{HandleMap, HANDLE_MAP_ENV, HANDLE_MAP_FLAG};

#[test]
fn test_parse_reference_input() {
    let map = HandleMap::parse("3:0x1A4;4:0x1B8;5:0x2C0");
    assert_eq!(map.len(), 3);
    assert_eq!(map.get(3), Some(0x1A4));
    assert_eq!(map.get(4), Some(0x1B8));
    assert_eq!(map.get(5), Some(0x2C0));
}

#[test]
fn test_garbage_is_empty_not_error() {
    let map = HandleMap::parse("garbage");
    assert!(map.is_empty());
}

#[test]
fn test_roundtrip_on_populated_subset() {
    let mut original = HandleMap::new();
    original.insert(3, 0xDEAD);
    original.insert(5, 0xBEEF);

    let reparsed = HandleMap::parse(&original.serialize());
    assert_eq!(reparsed, original);
}

#[test]
fn test_env_transport_and_precedence() {
    // Only this test touches the variable; tests run concurrently
    std::env::set_var(HANDLE_MAP_ENV, "3:0x33;4:0x44");
    let map = HandleMap::from_env().expect("env var set");
    assert_eq!(map.get(3), Some(0x33));
    assert_eq!(map.get(4), Some(0x44));

    // With both transports present, the environment wins; the flag is
    // stripped from argv regardless
    let mut args = vec![format!("{}3:0x99", HANDLE_MAP_FLAG)];
    let map = HandleMap::discover(&mut args);
    assert_eq!(map.get(3), Some(0x33));
    assert!(args.is_empty());

    std::env::remove_var(HANDLE_MAP_ENV);
}

#[test]
fn test_flag_transport_strips_argv() {
    let mut args = vec![
        "tool".to_string(),
        format!("{}3:0x10;4:0x20;5:0x30", HANDLE_MAP_FLAG),
        "input.txt".to_string(),
    ];
    let map = HandleMap::take_from_args(&mut args).expect("flag present");

    assert_eq!(map.len(), 3);
    // User code must never observe the flag
    assert_eq!(args, vec!["tool".to_string(), "input.txt".to_string()]);
}

#[test]
fn test_empty_map_serializes_empty() {
    assert_eq!(HandleMap::new().serialize(), "");
    assert!(HandleMap::parse("").is_empty());
}
