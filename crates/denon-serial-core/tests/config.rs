use std::io::Write;

use denon_serial_core::config::DeviceConfig;
use denon_serial_core::protocol::ProtocolError;
use pretty_assertions::assert_eq;
use tempfile::NamedTempFile;

#[test]
fn test_load_device_from_file() {
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            "name": "Den",
            "path": "/dev/ttyUSB1",
            "baudRate": 19200,
            "manufacturer": "Denon",
            "model": "AVR-3808CI",
            "serial": "A1234",
            "inputs": [
                {{"name": "TV", "type": 3, "input": "TV"}},
                {{"name": "CD", "type": 0, "input": "CD"}}
            ]
        }}"#
    )
    .unwrap();

    let device = DeviceConfig::from_file(file.path()).unwrap();
    assert_eq!(device.name, "Den");
    assert_eq!(device.model, "AVR-3808CI");
    assert_eq!(device.inputs.len(), 2);
    let serial = device.serial_config();
    assert_eq!(serial.port_name, "/dev/ttyUSB1");
    assert_eq!(serial.baud_rate, 19200);
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = DeviceConfig::from_file(dir.path().join("absent.json")).unwrap_err();
    assert!(matches!(err, ProtocolError::IoError(_)));
}

#[test]
fn test_malformed_json_is_config_error() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(b"{ not json").unwrap();
    let err = DeviceConfig::from_file(file.path()).unwrap_err();
    assert!(matches!(err, ProtocolError::Config(_)));
}
