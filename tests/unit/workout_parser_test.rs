//! Unit tests for workout file loading.

use ridelink::workouts::parser_zwo::parse_zwo;
use ridelink::workouts::types::{PlanItem, WorkoutBlock, WorkoutParseError, WorkoutPlan};
use std::io::Write;

const SWEET_SPOT_ZWO: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<workout_file>
    <author>Coach</author>
    <name>Sweet Spot 2x10</name>
    <description>Two sweet spot efforts &amp; a cooldown</description>
    <sportType>bike</sportType>
    <tags>
        <tag name="SST"/>
        <tag name="Intervals"/>
    </tags>
    <workout>
        <Warmup Duration="300" PowerLow="0.45" PowerHigh="0.75" Cadence="90"/>
        <IntervalsT Repeat="2" OnDuration="600" OffDuration="300" OnPower="0.9" OffPower="0.55" Cadence="92" CadenceResting="85">
            <textevent timeoffset="0" message="First effort"/>
        </IntervalsT>
        <Cooldown Duration="300" PowerLow="0.6" PowerHigh="0.4"/>
    </workout>
</workout_file>"#;

#[test]
fn test_parse_full_workout() {
    let plan = parse_zwo(SWEET_SPOT_ZWO).unwrap();

    assert_eq!(plan.name, "Sweet Spot 2x10");
    assert_eq!(plan.author.as_deref(), Some("Coach"));
    assert_eq!(
        plan.description.as_deref(),
        Some("Two sweet spot efforts & a cooldown")
    );
    assert_eq!(plan.tags, vec!["SST", "Intervals"]);
    assert_eq!(plan.items.len(), 3);
    assert_eq!(plan.total_duration_ms(), (300 + 2 * 900 + 300) * 1000);

    let blocks = plan.flatten(1.0);
    assert_eq!(blocks.len(), 6);
    assert_eq!(blocks[0].cadence_at(0), Some(90));
    assert_eq!(blocks[1].power_watts_at(0, 200), 180);
    assert_eq!(blocks[2].cadence_at(0), Some(85));
    assert_eq!(blocks[5].power_watts_at(0, 200), 120);
    assert_eq!(blocks[5].power_watts_at(300_000, 200), 80);
}

#[test]
fn test_interval_event_offset() {
    let plan = parse_zwo(SWEET_SPOT_ZWO).unwrap();
    assert_eq!(plan.events.len(), 1);
    assert_eq!(plan.events[0].at_ms, 300_000);
}

#[test]
fn test_parsed_plan_is_playable() {
    let plan = parse_zwo(SWEET_SPOT_ZWO).unwrap();
    assert!(plan.validate().is_ok());

    let (intensity_factor, tss) = plan.estimate_load().unwrap();
    assert!(intensity_factor > 0.5 && intensity_factor < 1.0);
    assert!(tss > 0.0);
}

#[test]
fn test_empty_workout() {
    let zwo = r#"<workout_file><name>Nothing</name><workout></workout></workout_file>"#;
    assert!(matches!(parse_zwo(zwo), Err(WorkoutParseError::EmptyWorkout)));
}

#[test]
fn test_missing_power() {
    let zwo = r#"<workout_file><workout><SteadyState Duration="60"/></workout></workout_file>"#;
    assert!(matches!(
        parse_zwo(zwo),
        Err(WorkoutParseError::MissingField(field)) if field == "Power"
    ));
}

#[test]
fn test_malformed_xml() {
    let zwo = r#"<workout_file><workout><SteadyState Duration="60" Power="0.5"></workout_file>"#;
    assert!(matches!(parse_zwo(zwo), Err(WorkoutParseError::InvalidXml(_))));
}

#[test]
fn test_json_plan_roundtrip_through_file() {
    let plan = WorkoutPlan::new(
        "Threshold",
        vec![
            PlanItem::Block {
                block: WorkoutBlock::ramp(600_000, 40.0, 70.0),
            },
            PlanItem::Intervals {
                repeats: 3,
                blocks: vec![
                    WorkoutBlock::constant(480_000, 100.0),
                    WorkoutBlock::constant(120_000, 50.0),
                ],
            },
        ],
    );

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("threshold.json");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(plan.to_json().unwrap().as_bytes()).unwrap();

    let loaded = WorkoutPlan::load(&path).unwrap();
    assert_eq!(loaded, plan);
}

#[test]
fn test_load_dispatches_on_extension() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sst.ZWO");
    std::fs::write(&path, SWEET_SPOT_ZWO).unwrap();

    let plan = WorkoutPlan::load(&path).unwrap();
    assert_eq!(plan.name, "Sweet Spot 2x10");

    assert!(matches!(
        WorkoutPlan::load(&dir.path().join("missing.json")),
        Err(WorkoutParseError::IoError(_))
    ));
}
