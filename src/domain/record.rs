// Streaming record domain model and line decoder
use super::fetch::FetchResult;
use thiserror::Error;

const VALUES_MARKER: &str = "V";

#[derive(Debug, Error, PartialEq)]
pub enum RecordError {
    #[error("empty record")]
    Empty,
    #[error("record for '{variable}' is truncated: {detail}")]
    Truncated { variable: String, detail: String },
    #[error("record for '{variable}' has invalid {field} '{token}'")]
    InvalidToken {
        variable: String,
        field: &'static str,
        token: String,
    },
}

/// One decoded event from the provider's live stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub variable: String,
    /// Explicit duplicate index when the provider tagged the name as `name@k`.
    pub duplicate: Option<usize>,
    pub value_type: i32,
    pub timestamps: Vec<i64>,
    pub values: Vec<f64>,
    pub units: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamLine {
    Heartbeat,
    Record(Record),
}

impl Record {
    /// Decode into buffers, scaling integer timestamps to nanoseconds.
    pub fn to_fetch_result(&self, timestamp_scale: i64) -> FetchResult {
        let x = self
            .timestamps
            .iter()
            .map(|t| t.saturating_mul(timestamp_scale) as f64)
            .collect();
        let y_unit = self.units.first().cloned().unwrap_or_default();
        FetchResult::new(x, self.values.clone(), "ns", y_unit)
    }
}

/// Split `name@k` into name and duplicate index. A bare name has no index.
pub fn split_channel(token: &str) -> (&str, Option<usize>) {
    match token.rsplit_once('@') {
        Some((name, index)) if !name.is_empty() => match index.parse() {
            Ok(k) => (name, Some(k)),
            Err(_) => (token, None),
        },
        _ => (token, None),
    }
}

/// Parse one line of the event stream.
///
/// Layout: `name type count ts_1 .. ts_n V value_1 unit_1 .. value_n unit_n`.
/// Units may be omitted entirely, in which case exactly `count` values follow `V`.
pub fn parse_line(line: &str, heartbeat_token: &str) -> Result<StreamLine, RecordError> {
    let mut tokens = line.split_whitespace();
    let head = tokens.next().ok_or(RecordError::Empty)?;
    if head == heartbeat_token {
        return Ok(StreamLine::Heartbeat);
    }

    let (name, duplicate) = split_channel(head);
    let variable = name.to_string();
    let truncated = |detail: &str| RecordError::Truncated {
        variable: variable.clone(),
        detail: detail.to_string(),
    };
    let invalid = |field: &'static str, token: &str| RecordError::InvalidToken {
        variable: variable.clone(),
        field,
        token: token.to_string(),
    };

    let type_token = tokens.next().ok_or_else(|| truncated("missing value type"))?;
    let value_type: i32 = type_token
        .parse()
        .map_err(|_| invalid("value type", type_token))?;

    let count_token = tokens.next().ok_or_else(|| truncated("missing sample count"))?;
    let count: usize = count_token
        .parse()
        .map_err(|_| invalid("sample count", count_token))?;

    let mut timestamps = Vec::with_capacity(count);
    for _ in 0..count {
        let token = tokens.next().ok_or_else(|| truncated("missing timestamps"))?;
        timestamps.push(token.parse().map_err(|_| invalid("timestamp", token))?);
    }

    match tokens.next() {
        Some(VALUES_MARKER) => {}
        Some(other) => return Err(invalid("values marker", other)),
        None => return Err(truncated("missing values marker")),
    }

    let rest: Vec<&str> = tokens.collect();
    let with_units = if rest.len() == count * 2 {
        true
    } else if rest.len() == count {
        false
    } else {
        return Err(truncated(&format!(
            "expected {} value tokens, found {}",
            count * 2,
            rest.len()
        )));
    };

    let stride = if with_units { 2 } else { 1 };
    let mut values = Vec::with_capacity(count);
    let mut units = Vec::with_capacity(if with_units { count } else { 0 });
    for pair in rest.chunks(stride) {
        let token = pair[0];
        values.push(token.parse().map_err(|_| invalid("value", token))?);
        if let Some(unit) = pair.get(1) {
            units.push((*unit).to_string());
        }
    }

    Ok(StreamLine::Record(Record {
        variable,
        duplicate,
        value_type,
        timestamps,
        values,
        units,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_record_with_units() {
        let line = "ip 1 2 10 20 V 1.5 MA 2.5 MA";
        let StreamLine::Record(record) = parse_line(line, "HEARTBEAT").unwrap() else {
            panic!("expected a record");
        };
        assert_eq!(record.variable, "ip");
        assert_eq!(record.duplicate, None);
        assert_eq!(record.timestamps, vec![10, 20]);
        assert_eq!(record.values, vec![1.5, 2.5]);

        let result = record.to_fetch_result(1000);
        assert_eq!(result.x, vec![10_000.0, 20_000.0]);
        assert_eq!(result.x_unit, "ns");
        assert_eq!(result.y_unit, "MA");
    }

    #[test]
    fn test_parse_record_without_units_and_duplicate_tag() {
        let line = "ne@1 0 1 7 V 3.25";
        let StreamLine::Record(record) = parse_line(line, "HEARTBEAT").unwrap() else {
            panic!("expected a record");
        };
        assert_eq!(record.variable, "ne");
        assert_eq!(record.duplicate, Some(1));
        assert!(record.units.is_empty());
        assert_eq!(record.to_fetch_result(1).y_unit, "");
    }

    #[test]
    fn test_heartbeat_is_recognised() {
        assert_eq!(
            parse_line("HEARTBEAT 1697712000", "HEARTBEAT").unwrap(),
            StreamLine::Heartbeat
        );
    }

    #[test]
    fn test_malformed_records() {
        assert_eq!(parse_line("   ", "HB"), Err(RecordError::Empty));
        assert!(matches!(
            parse_line("ip 1 2 10 V 1 A", "HB"),
            Err(RecordError::InvalidToken { field: "timestamp", .. })
        ));
        assert!(matches!(
            parse_line("ip 1 1 10 V 1 A 2", "HB"),
            Err(RecordError::Truncated { .. })
        ));
        assert!(matches!(
            parse_line("ip x 1 10 V 1", "HB"),
            Err(RecordError::InvalidToken { field: "value type", .. })
        ));
    }

    #[test]
    fn test_split_channel() {
        assert_eq!(split_channel("a@2"), ("a", Some(2)));
        assert_eq!(split_channel("a"), ("a", None));
        assert_eq!(split_channel("user@host"), ("user@host", None));
    }
}
