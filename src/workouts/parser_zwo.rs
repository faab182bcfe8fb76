//! Zwift workout (.zwo) file parser.
//!
//! ZWO files are XML workout definitions. Segment elements become blocks,
//! `IntervalsT` becomes a repeated interval group, and `textevent` children
//! become message events positioned relative to their segment.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::path::Path;
use std::str::FromStr;

use crate::workouts::types::{
    CadenceRange, EventKind, PlanItem, WorkoutBlock, WorkoutEvent, WorkoutParseError, WorkoutPlan,
};

/// Parse a ZWO workout from XML content.
pub fn parse_zwo(content: &str) -> Result<WorkoutPlan, WorkoutParseError> {
    let mut reader = Reader::from_str(content);
    reader.trim_text(true);

    let mut workout_name: Option<String> = None;
    let mut workout_author: Option<String> = None;
    let mut workout_description: Option<String> = None;
    let mut tags: Vec<String> = Vec::new();
    let mut items: Vec<PlanItem> = Vec::new();
    let mut events: Vec<WorkoutEvent> = Vec::new();

    let mut in_workout = false;
    let mut current_element: Option<String> = None;
    // Start offset of the segment whose children are being read
    let mut segment_start: Option<u64> = None;
    let mut cursor_ms: u64 = 0;
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let (element, has_children) = match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => (e.into_owned(), true),
            Ok(Event::Empty(e)) => (e.into_owned(), false),
            Ok(Event::Text(e)) => {
                if let Some(ref elem) = current_element {
                    let text = e.unescape().map_err(|e| {
                        WorkoutParseError::InvalidXml(format!("Failed to unescape text: {}", e))
                    })?;
                    match elem.as_str() {
                        "name" => workout_name = Some(text.to_string()),
                        "author" => workout_author = Some(text.to_string()),
                        "description" => workout_description = Some(text.to_string()),
                        _ => {}
                    }
                }
                continue;
            }
            Ok(Event::End(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if name == "workout" {
                    in_workout = false;
                } else if in_workout && is_segment(&name) {
                    segment_start = None;
                }
                current_element = None;
                continue;
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(WorkoutParseError::InvalidXml(format!(
                    "XML parsing error: {}",
                    e
                )));
            }
            _ => {
                continue;
            }
        };

        let name = String::from_utf8_lossy(element.name().as_ref()).to_string();
        match name.as_str() {
            "name" | "author" | "description" if !in_workout => {
                current_element = Some(name);
            }
            "workout" => in_workout = has_children,
            "tag" => {
                if let Some(tag) = attr_string(&element, "name") {
                    tags.push(tag);
                }
            }
            "textevent" | "TextEvent" if in_workout => {
                let Some(start) = segment_start else {
                    tracing::debug!("Ignoring textevent outside a segment");
                    continue;
                };
                let offset_s: u64 = attr(&element, "timeoffset")?.unwrap_or(0);
                let text = attr_string(&element, "message").unwrap_or_default();
                events.push(WorkoutEvent {
                    id: format!("text-{}", events.len()),
                    at_ms: start + offset_s * 1000,
                    kind: EventKind::Message { text },
                });
            }
            _ if in_workout && is_segment(&name) => {
                let item = parse_item(&name, &element)?;
                if has_children {
                    segment_start = Some(cursor_ms);
                }
                cursor_ms += item.duration_ms();
                items.push(item);
            }
            _ if in_workout => {
                tracing::debug!("Skipping unknown workout element {}", name);
            }
            _ => {}
        }
    }

    if items.is_empty() {
        return Err(WorkoutParseError::EmptyWorkout);
    }

    let name = workout_name.unwrap_or_else(|| "Unnamed Workout".to_string());
    let mut plan = WorkoutPlan::new(name, items).with_events(events);
    plan.author = workout_author;
    plan.description = workout_description;
    plan.tags = tags;

    Ok(plan)
}

fn is_segment(name: &str) -> bool {
    matches!(
        name,
        "Warmup" | "Cooldown" | "SteadyState" | "Ramp" | "IntervalsT" | "FreeRide"
    )
}

fn attr_string(element: &BytesStart<'_>, key: &str) -> Option<String> {
    element
        .attributes()
        .flatten()
        .find(|a| a.key.as_ref() == key.as_bytes())
        .map(|a| String::from_utf8_lossy(&a.value).to_string())
}

/// Parse an optional attribute.
fn attr<T: FromStr>(element: &BytesStart<'_>, key: &str) -> Result<Option<T>, WorkoutParseError> {
    attr_string(element, key)
        .map(|value| {
            value.parse().map_err(|_| WorkoutParseError::InvalidValue {
                field: key.to_string(),
                value,
            })
        })
        .transpose()
}

fn required<T: FromStr>(element: &BytesStart<'_>, key: &str) -> Result<T, WorkoutParseError> {
    attr(element, key)?.ok_or_else(|| WorkoutParseError::MissingField(key.to_string()))
}

/// ZWO power is a fraction of FTP.
fn pct(fraction: f32) -> f32 {
    fraction * 100.0
}

fn cadence_range(low: Option<u16>, high: Option<u16>) -> Option<CadenceRange> {
    match (low, high) {
        (Some(min_rpm), Some(max_rpm)) => Some(CadenceRange { min_rpm, max_rpm }),
        _ => None,
    }
}

/// Parse one segment element.
fn parse_item(name: &str, element: &BytesStart<'_>) -> Result<PlanItem, WorkoutParseError> {
    if name == "IntervalsT" {
        return parse_intervals(element);
    }
    if name == "FreeRide" {
        return Err(WorkoutParseError::UnsupportedFormat(
            "FreeRide segments have no power target".to_string(),
        ));
    }

    let duration_s: u64 = required(element, "Duration")?;
    let duration_ms = duration_s * 1000;
    let cadence: Option<u16> = attr(element, "Cadence")?;
    let cadence_low: Option<u16> = attr(element, "CadenceLow")?;
    let cadence_high: Option<u16> = attr(element, "CadenceHigh")?;

    let power: Option<f32> = attr(element, "Power")?;
    let power_low: Option<f32> = attr(element, "PowerLow")?;
    let power_high: Option<f32> = attr(element, "PowerHigh")?;

    let block = match (power_low, power_high, power) {
        (Some(low), Some(high), _) => WorkoutBlock::Ramp {
            duration_ms,
            start_pct: pct(low),
            end_pct: pct(high),
            start_cadence_rpm: cadence_low.or(cadence),
            end_cadence_rpm: cadence_high.or(cadence),
        },
        (_, _, Some(p)) => WorkoutBlock::Constant {
            duration_ms,
            power_pct: pct(p),
            cadence_rpm: cadence,
            cadence_range: cadence_range(cadence_low, cadence_high),
        },
        _ => return Err(WorkoutParseError::MissingField("Power".to_string())),
    };

    Ok(PlanItem::Block { block })
}

/// Parse an `IntervalsT` element into a repeated on/off group.
fn parse_intervals(element: &BytesStart<'_>) -> Result<PlanItem, WorkoutParseError> {
    let repeats: u32 = attr(element, "Repeat")?.unwrap_or(1);
    let on_s: u64 = attr(element, "OnDuration")?.unwrap_or(0);
    let off_s: u64 = attr(element, "OffDuration")?.unwrap_or(0);
    let on_power: f32 = attr(element, "OnPower")?.unwrap_or(1.0);
    let off_power: f32 = attr(element, "OffPower")?.unwrap_or(0.5);
    let on_cadence: Option<u16> = attr(element, "Cadence")?;
    let off_cadence: Option<u16> = attr(element, "CadenceResting")?;

    if on_s == 0 && off_s == 0 {
        return Err(WorkoutParseError::MissingField(
            "OnDuration/OffDuration".to_string(),
        ));
    }

    let mut blocks = Vec::new();
    if on_s > 0 {
        blocks.push(WorkoutBlock::Constant {
            duration_ms: on_s * 1000,
            power_pct: pct(on_power),
            cadence_rpm: on_cadence,
            cadence_range: None,
        });
    }
    if off_s > 0 {
        blocks.push(WorkoutBlock::Constant {
            duration_ms: off_s * 1000,
            power_pct: pct(off_power),
            cadence_rpm: off_cadence,
            cadence_range: None,
        });
    }

    Ok(PlanItem::Intervals { repeats, blocks })
}

/// Parse a ZWO file from disk.
pub fn parse_zwo_file(path: &Path) -> Result<WorkoutPlan, WorkoutParseError> {
    let content =
        std::fs::read_to_string(path).map_err(|e| WorkoutParseError::IoError(e.to_string()))?;
    parse_zwo(&content)
}
