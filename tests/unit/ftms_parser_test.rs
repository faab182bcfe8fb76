//! Unit tests for FTMS and BLE profile data parsing.

use ridelink::sensors::ftms::{
    build_control_point_response, build_request_control, build_set_target_power,
    parse_control_point_response, parse_csc_measurement, parse_cycling_power_measurement,
    parse_fitness_machine_features, parse_heart_rate_measurement, parse_indoor_bike_data,
    ControlCommand, FtmsError, ResultCode, RevolutionTracker,
};

#[test]
fn test_parse_indoor_bike_data_minimal() {
    // Flags: 0x0000 (only instantaneous speed present)
    // Speed: 0 km/h
    let data = [0x00, 0x00, 0x00, 0x00];
    let result = parse_indoor_bike_data(&data).unwrap();

    assert_eq!(result.speed_kmh, Some(0.0));
    assert!(result.power_watts.is_none());
    assert!(result.cadence_rpm.is_none());
}

#[test]
fn test_parse_indoor_bike_data_more_data_skips_speed() {
    // Flags: 0x0041 (more data + instantaneous power)
    // Power: 200W
    let data = [0x41, 0x00, 0xC8, 0x00];
    let result = parse_indoor_bike_data(&data).unwrap();

    assert!(result.speed_kmh.is_none());
    assert_eq!(result.power_watts, Some(200));
}

#[test]
fn test_parse_indoor_bike_data_many_fields() {
    // Flags: 0x0A46 (avg speed, cadence, power, heart rate, elapsed time)
    // Speed: 3000 = 30.00 km/h, Avg speed: 2800 = 28.00 km/h
    // Cadence: 180 = 90 RPM, Power: 210W, HR: 142, Elapsed: 600s
    let data = [
        0x46, 0x0A, 0xB8, 0x0B, 0xF0, 0x0A, 0xB4, 0x00, 0xD2, 0x00, 0x8E, 0x58, 0x02,
    ];
    let result = parse_indoor_bike_data(&data).unwrap();

    assert!((result.speed_kmh.unwrap() - 30.0).abs() < 0.01);
    assert!((result.avg_speed_kmh.unwrap() - 28.0).abs() < 0.01);
    assert_eq!(result.cadence_rpm, Some(90.0));
    assert_eq!(result.power_watts, Some(210));
    assert_eq!(result.heart_rate_bpm, Some(142));
    assert_eq!(result.elapsed_time_s, Some(600));
    assert!(result.remaining_time_s.is_none());
}

#[test]
fn test_parse_indoor_bike_data_too_short() {
    assert!(parse_indoor_bike_data(&[0x44]).is_none());
    assert!(parse_indoor_bike_data(&[]).is_none());
}

#[test]
fn test_parse_cycling_power_with_crank_data() {
    // Flags: 0x0020 (crank revolution data)
    // Power: 180W, crank revs: 100, event time: 2048/1024 s
    let data = [0x20, 0x00, 0xB4, 0x00, 0x64, 0x00, 0x00, 0x08];
    let result = parse_cycling_power_measurement(&data).unwrap();

    assert_eq!(result.power_watts, 180);
    assert_eq!(result.crank, Some((100, 2048)));
    assert!(result.wheel.is_none());
}

#[test]
fn test_parse_csc_wheel_and_crank() {
    let data = [0x03, 0xE8, 0x03, 0x00, 0x00, 0x00, 0x04, 0x32, 0x00, 0x00, 0x02];
    let result = parse_csc_measurement(&data).unwrap();

    assert_eq!(result.wheel, Some((1000, 1024)));
    assert_eq!(result.crank, Some((50, 512)));
}

#[test]
fn test_parse_heart_rate_with_energy() {
    // Flags: 0x08 (energy expended), HR: 72, energy: 16 kJ
    let data = [0x08, 72, 0x10, 0x00];
    let result = parse_heart_rate_measurement(&data).unwrap();

    assert_eq!(result.heart_rate_bpm, 72);
    assert_eq!(result.energy_expended, Some(16));
    assert!(!result.sensor_contact);
}

#[test]
fn test_crank_tracker_rate() {
    let mut tracker = RevolutionTracker::crank();
    assert!(tracker.update(50, 0).is_none());

    // Two revolutions in one second
    let rpm = tracker.update(52, 1024).unwrap();
    assert!((rpm - 120.0).abs() < 0.01);

    // Same event repeated
    assert!(tracker.update(52, 1024).is_none());
}

#[test]
fn test_set_target_power_is_clamped() {
    assert_eq!(build_set_target_power(200), vec![0x05, 0xC8, 0x00]);
    assert_eq!(build_set_target_power(5000), vec![0x05, 0xDC, 0x05]);
    assert_eq!(build_set_target_power(10), vec![0x05, 0x19, 0x00]);
    assert_eq!(build_set_target_power(-50), vec![0x05, 0x19, 0x00]);
}

#[test]
fn test_control_command_encoding() {
    assert_eq!(ControlCommand::RequestControl.encode(), build_request_control());
    assert_eq!(
        ControlCommand::SetTargetPower(250).encode(),
        vec![0x05, 0xFA, 0x00]
    );
}

#[test]
fn test_control_point_response_parsing() {
    let ok = parse_control_point_response(&[0x80, 0x05, 0x01]).unwrap();
    assert_eq!(ok.request_opcode, 0x05);
    assert!(ok.result.is_success());

    let rejected =
        parse_control_point_response(&build_control_point_response(0x00, ResultCode::ControlNotPermitted))
            .unwrap();
    assert_eq!(rejected.request_opcode, 0x00);
    assert_eq!(rejected.result, ResultCode::ControlNotPermitted);
}

#[test]
fn test_control_point_response_errors() {
    assert!(matches!(
        parse_control_point_response(&[0x80, 0x05]),
        Err(FtmsError::ShortFrame { len: 2, .. })
    ));
    assert!(matches!(
        parse_control_point_response(&[0x01, 0x05, 0x01]),
        Err(FtmsError::NotAResponse(0x01))
    ));
    assert!(matches!(
        parse_control_point_response(&[0x80, 0x05, 0x09]),
        Err(FtmsError::UnknownResultCode(0x09))
    ));
}

#[test]
fn test_feature_power_target_bit() {
    let features = parse_fitness_machine_features(&[0x02, 0x40, 0, 0, 0x08, 0, 0, 0]).unwrap();
    assert!(features.supports_power_target());

    let features = parse_fitness_machine_features(&[0x02, 0x40, 0, 0, 0x04, 0, 0, 0]).unwrap();
    assert!(!features.supports_power_target());

    assert!(parse_fitness_machine_features(&[0x02, 0x40, 0, 0]).is_err());
}
