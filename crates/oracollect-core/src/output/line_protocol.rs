//! InfluxDB line protocol encoding.
//!
//! `measurement,tag=v field=1i,other="x" 1700000000`

use std::fmt::Write as _;

use serde::Deserialize;

use crate::data::{FieldValue, MetricPoint};

/// Timestamp unit of encoded points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum Precision {
    #[default]
    #[serde(rename = "s")]
    Seconds,
    #[serde(rename = "ms")]
    Milliseconds,
    #[serde(rename = "us")]
    Microseconds,
    #[serde(rename = "ns")]
    Nanoseconds,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LineProtocol {
    precision: Precision,
}

impl LineProtocol {
    pub fn new(precision: Precision) -> Self {
        Self { precision }
    }

    /// Appends one line per point to `out`. Returns the number of lines written.
    ///
    /// Tags with empty values and non-finite floats are left out; a point left
    /// with no fields is skipped.
    pub fn encode_into(&self, points: &[MetricPoint], out: &mut String) -> usize {
        points.iter().filter(|p| self.encode_point(p, out)).count()
    }

    pub fn encode(&self, points: &[MetricPoint]) -> String {
        let mut out = String::new();
        self.encode_into(points, &mut out);
        out
    }

    fn encode_point(&self, point: &MetricPoint, out: &mut String) -> bool {
        let mut fields = String::new();
        for (key, value) in point.fields() {
            if let FieldValue::Float(v) = value
                && !v.is_finite()
            {
                continue;
            }
            if !fields.is_empty() {
                fields.push(',');
            }
            escape(key, KEY_SPECIALS, &mut fields);
            fields.push('=');
            write_value(value, &mut fields);
        }
        if fields.is_empty() {
            return false;
        }

        escape(point.name(), MEASUREMENT_SPECIALS, out);
        for (key, value) in point.tags() {
            if key.is_empty() || value.is_empty() {
                continue;
            }
            out.push(',');
            escape(key, KEY_SPECIALS, out);
            out.push('=');
            escape(value, KEY_SPECIALS, out);
        }
        out.push(' ');
        out.push_str(&fields);
        out.push(' ');
        let ts = point.timestamp();
        let stamp = match self.precision {
            Precision::Seconds => ts.timestamp(),
            Precision::Milliseconds => ts.timestamp_millis(),
            Precision::Microseconds => ts.timestamp_micros(),
            Precision::Nanoseconds => ts.timestamp_nanos_opt().unwrap_or(i64::MAX),
        };
        let _ = write!(out, "{stamp}");
        out.push('\n');
        true
    }
}

const MEASUREMENT_SPECIALS: &[char] = &[',', ' '];
const KEY_SPECIALS: &[char] = &[',', '=', ' '];

fn escape(s: &str, specials: &[char], out: &mut String) {
    for c in s.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            c if specials.contains(&c) => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
}

fn write_value(value: &FieldValue, out: &mut String) {
    match value {
        FieldValue::Int(v) => {
            let _ = write!(out, "{v}i");
        }
        FieldValue::Float(v) => {
            let _ = write!(out, "{v}");
        }
        FieldValue::Bool(v) => out.push_str(if *v { "true" } else { "false" }),
        FieldValue::Str(s) => {
            out.push('"');
            for c in s.chars() {
                if c == '"' || c == '\\' {
                    out.push('\\');
                }
                out.push(c);
            }
            out.push('"');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Fields, Tags};
    use chrono::{TimeZone, Utc};

    fn point(tags: &[(&str, &str)], fields: Vec<(&str, FieldValue)>) -> MetricPoint {
        let tags: Tags = tags.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        let fields: Fields = fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
        let ts = Utc.timestamp_opt(1_700_000_000, 123_000_000).unwrap();
        MetricPoint::new("oracle_status", tags, fields, ts)
    }

    #[test]
    fn test_encodes_all_value_kinds() {
        let p = point(
            &[("instance", "ORCL1"), ("db", "ORCL")],
            vec![
                ("sessions", FieldValue::Int(42)),
                ("ratio", FieldValue::Float(0.5)),
                ("ok", FieldValue::Bool(true)),
                ("mode", FieldValue::Str("READ WRITE".into())),
            ],
        );
        assert_eq!(
            LineProtocol::default().encode(&[p]),
            "oracle_status,db=ORCL,instance=ORCL1 mode=\"READ WRITE\",ok=true,ratio=0.5,sessions=42i 1700000000\n"
        );
    }

    #[test]
    fn test_escapes_special_characters() {
        let p = point(
            &[("host name", "a,b=c"), ("empty", "")],
            vec![("msg", FieldValue::Str("say \"hi\" \\o/".into()))],
        );
        assert_eq!(
            LineProtocol::default().encode(&[p]),
            "oracle_status,host\\ name=a\\,b\\=c msg=\"say \\\"hi\\\" \\\\o/\" 1700000000\n"
        );
    }

    #[test]
    fn test_precision_changes_timestamp_unit() {
        let p = point(&[], vec![("v", FieldValue::Int(1))]);
        let ms = LineProtocol::new(Precision::Milliseconds).encode(std::slice::from_ref(&p));
        assert!(ms.ends_with(" 1700000000123\n"), "{ms}");
        let ns = LineProtocol::new(Precision::Nanoseconds).encode(&[p]);
        assert!(ns.ends_with(" 1700000000123000000\n"), "{ns}");
    }

    #[test]
    fn test_points_without_usable_fields_are_skipped() {
        let p = point(&[], vec![("v", FieldValue::Float(f64::NAN))]);
        let mut out = String::new();
        assert_eq!(LineProtocol::default().encode_into(&[p], &mut out), 0);
        assert!(out.is_empty());
    }
}
