//! Tests for `parse_heartbeat_header` and `HeartbeatConfig`.

use stompline::{HeartbeatConfig, parse_heartbeat_header};

// ============================================================================
// parse_heartbeat_header
// ============================================================================

#[test]
fn parse_standard_heartbeat() {
    assert_eq!(parse_heartbeat_header("1000,1000"), (1000, 1000));
}

#[test]
fn parse_asymmetric_heartbeat() {
    assert_eq!(parse_heartbeat_header("0,5000"), (0, 5000));
}

#[test]
fn parse_whitespace_padded() {
    assert_eq!(parse_heartbeat_header(" 100 ,\t200 "), (100, 200));
}

#[test]
fn parse_missing_or_empty_fields_default_to_zero() {
    assert_eq!(parse_heartbeat_header(""), (0, 0));
    assert_eq!(parse_heartbeat_header("300"), (300, 0));
    assert_eq!(parse_heartbeat_header("300,"), (300, 0));
    assert_eq!(parse_heartbeat_header(",300"), (0, 300));
}

#[test]
fn parse_invalid_fields_default_to_zero() {
    assert_eq!(parse_heartbeat_header("abc,100"), (0, 100));
    assert_eq!(parse_heartbeat_header("100,-5"), (100, 0));
    assert_eq!(parse_heartbeat_header("x,y"), (0, 0));
}

#[test]
fn parse_extra_fields_ignored() {
    assert_eq!(parse_heartbeat_header("1,2,3"), (1, 2));
}

// ============================================================================
// HeartbeatConfig
// ============================================================================

#[test]
fn config_header_value_round_trips() {
    let config = HeartbeatConfig::new(250, 4000);
    assert_eq!(config.header_value(), "250,4000");
    assert_eq!(parse_heartbeat_header(&config.header_value()), (250, 4000));
}

#[test]
fn default_config_is_enabled_at_one_second() {
    let config = HeartbeatConfig::default();
    assert!(config.enabled);
    assert_eq!((config.cx, config.cy), (1000, 1000));
    assert!(!HeartbeatConfig::disabled().enabled);
}
