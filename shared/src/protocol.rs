//! Line protocol between hazard clients and the server.
//!
//! Every message is one line of space separated fields terminated by `\n`:
//!
//! ```text
//! SUBMIT <TYPE> <lat> <lon> <date> <confirmations>
//! NOT_SEEN <TYPE> <lat> <lon> <date>
//! GET_INFOS <lat> <lon>
//! ```
//!
//! Only `GET_INFOS` is answered, with an `INFOS <n>` header followed by `n`
//! lines `INFO <TYPE> <lat> <lon> <date> <confirmations>`. Dates use the fixed
//! `yyyy-MM-dd'T'HH:mm:ss.SSSZ` layout and numbers always use `.` as decimal
//! separator, whatever the host locale.

use crate::poi::{Poi, PoiType, UnknownPoiType};
use chrono::{DateTime, Utc};
use std::str::SplitWhitespace;
use thiserror::Error;

pub const SUBMIT: &str = "SUBMIT";
pub const NOT_SEEN: &str = "NOT_SEEN";
pub const GET_INFOS: &str = "GET_INFOS";
pub const INFOS: &str = "INFOS";
pub const INFO: &str = "INFO";

/// chrono layout of `yyyy-MM-dd'T'HH:mm:ss.SSSZ`
pub const WIRE_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f%z";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("empty command line")]
    EmptyLine,
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
    #[error("missing {0}")]
    MissingField(&'static str),
    #[error("unexpected trailing field `{0}`")]
    TrailingField(String),
    #[error(transparent)]
    UnknownType(#[from] UnknownPoiType),
    #[error("invalid {field}: `{value}`")]
    InvalidNumber { field: &'static str, value: String },
    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },
    #[error("invalid date `{0}`")]
    InvalidDate(String),
    #[error("expected {expected} line, got `{line}`")]
    UnexpectedLine { expected: &'static str, line: String },
    #[error("INFOS announced {announced} entries but {received} followed")]
    CountMismatch { announced: usize, received: usize },
}

/// A decoded client command
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Report a new hazard or corroborate an existing one
    Submit(Poi),
    /// Report that an advertised hazard is gone
    NotSeen(Poi),
    /// Ask for every active hazard around a position
    GetInfos { latitude: f64, longitude: f64 },
}

/// A server reply. Only `GET_INFOS` produces one.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Infos(Vec<Poi>),
}

impl Request {
    /// Decodes one command line. A trailing `\r` is tolerated.
    pub fn parse(line: &str) -> Result<Request, ProtocolError> {
        let mut fields = Fields::new(line);
        let command = fields.next_opt().ok_or(ProtocolError::EmptyLine)?;

        let request = match command {
            SUBMIT => {
                let poi = fields.poi()?;
                let confirmations = fields.count("confirmations")?;
                Request::Submit(poi.with_counters(confirmations, 0))
            }
            NOT_SEEN => Request::NotSeen(fields.poi()?),
            GET_INFOS => {
                let latitude = fields.latitude()?;
                let longitude = fields.longitude()?;
                Request::GetInfos {
                    latitude,
                    longitude,
                }
            }
            other => return Err(ProtocolError::UnknownCommand(other.to_string())),
        };

        fields.finish()?;
        Ok(request)
    }

    /// Encodes the command without its line terminator.
    pub fn encode(&self) -> String {
        match self {
            Request::Submit(poi) => format!(
                "{} {} {}",
                SUBMIT,
                encode_poi_fields(poi),
                poi.confirmations()
            ),
            Request::NotSeen(poi) => format!("{} {}", NOT_SEEN, encode_poi_fields(poi)),
            Request::GetInfos {
                latitude,
                longitude,
            } => format!(
                "{} {} {}",
                GET_INFOS,
                format_number(*latitude),
                format_number(*longitude)
            ),
        }
    }
}

impl Response {
    /// Encodes the reply as lines without terminators.
    pub fn encode(&self) -> Vec<String> {
        match self {
            Response::Infos(pois) => encode_infos(pois),
        }
    }
}

/// Encodes an `INFOS` header and one `INFO` line per report
pub fn encode_infos(pois: &[Poi]) -> Vec<String> {
    let mut lines = Vec::with_capacity(pois.len() + 1);
    lines.push(format!("{} {}", INFOS, pois.len()));
    lines.extend(pois.iter().map(encode_info));
    lines
}

/// Formats one `INFO` line of a `GET_INFOS` answer.
///
/// The line carries type, position, creation date and both counters, in the
/// order [`parse_info_line`] expects.
pub fn encode_info(poi: &Poi) -> String {
    format!("{} {} {}", INFO, encode_poi_fields(poi), poi.confirmations())
}

/// Parses `INFOS <n>` and returns `n`
pub fn parse_infos_header(line: &str) -> Result<usize, ProtocolError> {
    let mut fields = Fields::new(line);
    match fields.next_opt() {
        Some(INFOS) => {}
        _ => {
            return Err(ProtocolError::UnexpectedLine {
                expected: INFOS,
                line: line.to_string(),
            })
        }
    }
    let raw = fields.next("entry count")?;
    let count = raw.parse::<usize>().map_err(|_| ProtocolError::InvalidNumber {
        field: "entry count",
        value: raw.to_string(),
    })?;
    fields.finish()?;
    Ok(count)
}

/// Parses one `INFO` line of an `INFOS` reply
pub fn parse_info_line(line: &str) -> Result<Poi, ProtocolError> {
    let mut fields = Fields::new(line);
    match fields.next_opt() {
        Some(INFO) => {}
        _ => {
            return Err(ProtocolError::UnexpectedLine {
                expected: INFO,
                line: line.to_string(),
            })
        }
    }
    let poi = fields.poi()?;
    let confirmations = fields.count("confirmations")?;
    fields.finish()?;
    Ok(poi.with_counters(confirmations, 0))
}

/// Decodes a complete `INFOS` reply. The header count must match the number
/// of lines that follow it.
pub fn decode_infos<I, S>(lines: I) -> Result<Vec<Poi>, ProtocolError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut lines = lines.into_iter();
    let header = lines.next().ok_or(ProtocolError::MissingField("INFOS header"))?;
    let announced = parse_infos_header(header.as_ref())?;

    let body: Vec<S> = lines.collect();
    if body.len() != announced {
        return Err(ProtocolError::CountMismatch {
            announced,
            received: body.len(),
        });
    }

    body.iter().map(|line| parse_info_line(line.as_ref())).collect()
}

/// Formats a date the way it travels on the wire, always with a `+0000`
/// offset and millisecond precision.
pub fn format_wire_date(date: &DateTime<Utc>) -> String {
    date.format(WIRE_DATE_FORMAT).to_string()
}

/// Parses a wire date in any offset and normalises it to UTC
pub fn parse_wire_date(raw: &str) -> Result<DateTime<Utc>, ProtocolError> {
    DateTime::parse_from_str(raw, WIRE_DATE_FORMAT)
        .map(|date| date.with_timezone(&Utc))
        .map_err(|_| ProtocolError::InvalidDate(raw.to_string()))
}

/// Formats a float with `.` as decimal separator and at least one fractional
/// digit, never in exponent notation.
pub fn format_number(value: f64) -> String {
    let mut text = value.to_string();
    if value.is_finite() && !text.contains('.') {
        text.push_str(".0");
    }
    text
}

fn encode_poi_fields(poi: &Poi) -> String {
    format!(
        "{} {} {} {}",
        poi.poi_type().name(),
        format_number(poi.latitude()),
        format_number(poi.longitude()),
        format_wire_date(&poi.created_at())
    )
}

/// Cursor over the whitespace separated fields of a line
struct Fields<'a> {
    inner: SplitWhitespace<'a>,
}

impl<'a> Fields<'a> {
    fn new(line: &'a str) -> Self {
        Self {
            inner: line.split_whitespace(),
        }
    }

    fn next_opt(&mut self) -> Option<&'a str> {
        self.inner.next()
    }

    fn next(&mut self, name: &'static str) -> Result<&'a str, ProtocolError> {
        self.inner.next().ok_or(ProtocolError::MissingField(name))
    }

    fn finish(mut self) -> Result<(), ProtocolError> {
        match self.inner.next() {
            Some(extra) => Err(ProtocolError::TrailingField(extra.to_string())),
            None => Ok(()),
        }
    }

    fn coordinate(&mut self, name: &'static str, limit: f64) -> Result<f64, ProtocolError> {
        let raw = self.next(name)?;
        let value = raw
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| ProtocolError::InvalidNumber {
                field: name,
                value: raw.to_string(),
            })?;
        if value.abs() > limit {
            return Err(ProtocolError::OutOfRange { field: name, value });
        }
        Ok(value)
    }

    fn latitude(&mut self) -> Result<f64, ProtocolError> {
        self.coordinate("latitude", 90.0)
    }

    fn longitude(&mut self) -> Result<f64, ProtocolError> {
        self.coordinate("longitude", 180.0)
    }

    fn count(&mut self, name: &'static str) -> Result<u32, ProtocolError> {
        let raw = self.next(name)?;
        raw.parse::<u32>().map_err(|_| ProtocolError::InvalidNumber {
            field: name,
            value: raw.to_string(),
        })
    }

    /// `<TYPE> <lat> <lon> <date>`
    fn poi(&mut self) -> Result<Poi, ProtocolError> {
        let poi_type = self.next("poi type")?.parse::<PoiType>()?;
        let latitude = self.latitude()?;
        let longitude = self.longitude()?;
        let created_at = parse_wire_date(self.next("date")?)?;
        Ok(poi_type.construct(latitude, longitude, created_at, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn sample_date() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2012, 5, 3, 14, 22, 1).unwrap() + Duration::milliseconds(123)
    }

    #[test]
    fn test_wire_date_format() {
        assert_eq!(format_wire_date(&sample_date()), "2012-05-03T14:22:01.123+0000");
        assert_eq!(
            parse_wire_date("2012-05-03T14:22:01.123+0000").unwrap(),
            sample_date()
        );
    }

    #[test]
    fn test_wire_date_offset_normalised() {
        let parsed = parse_wire_date("2012-05-03T16:22:01.123+0200").unwrap();
        assert_eq!(parsed, sample_date());
    }

    #[test]
    fn test_parse_submit() {
        let line = "SUBMIT ACCIDENT 48.8566 2.3522 2012-05-03T14:22:01.123+0000 4";
        match Request::parse(line).unwrap() {
            Request::Submit(poi) => {
                assert_eq!(poi.poi_type(), PoiType::Accident);
                assert_eq!(poi.latitude(), 48.8566);
                assert_eq!(poi.longitude(), 2.3522);
                assert_eq!(poi.created_at(), sample_date());
                assert_eq!(poi.confirmations(), 4);
            }
            other => panic!("Unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_parse_not_seen() {
        let line = "NOT_SEEN ROADWORKS -33.5 151.25 2012-05-03T14:22:01.123+0000\r";
        match Request::parse(line).unwrap() {
            Request::NotSeen(poi) => {
                assert_eq!(poi.poi_type(), PoiType::Roadworks);
                assert_eq!(poi.latitude(), -33.5);
                assert_eq!(poi.longitude(), 151.25);
            }
            other => panic!("Unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_parse_get_infos() {
        assert_eq!(
            Request::parse("GET_INFOS 48.8566 2.3522").unwrap(),
            Request::GetInfos {
                latitude: 48.8566,
                longitude: 2.3522
            }
        );
    }

    #[test]
    fn test_rejects_malformed_lines() {
        let cases = vec![
            ("", ProtocolError::EmptyLine),
            ("   ", ProtocolError::EmptyLine),
            ("HELLO 1 2", ProtocolError::UnknownCommand("HELLO".to_string())),
            ("get_infos 1 2", ProtocolError::UnknownCommand("get_infos".to_string())),
            ("GET_INFOS 1", ProtocolError::MissingField("longitude")),
            ("GET_INFOS 1 2 3", ProtocolError::TrailingField("3".to_string())),
            (
                "GET_INFOS 1,5 2",
                ProtocolError::InvalidNumber {
                    field: "latitude",
                    value: "1,5".to_string(),
                },
            ),
            (
                "GET_INFOS NaN 2",
                ProtocolError::InvalidNumber {
                    field: "latitude",
                    value: "NaN".to_string(),
                },
            ),
            (
                "GET_INFOS 91 2",
                ProtocolError::OutOfRange {
                    field: "latitude",
                    value: 91.0,
                },
            ),
            (
                "GET_INFOS 1 -180.5",
                ProtocolError::OutOfRange {
                    field: "longitude",
                    value: -180.5,
                },
            ),
            (
                "SUBMIT BOGUS_TYPE 1 2 not-a-date 0",
                ProtocolError::UnknownType(UnknownPoiType("BOGUS_TYPE".to_string())),
            ),
            (
                "SUBMIT ACCIDENT 1 2 not-a-date 0",
                ProtocolError::InvalidDate("not-a-date".to_string()),
            ),
            (
                "SUBMIT ACCIDENT 1 2 2012-05-03T14:22:01.123+0000",
                ProtocolError::MissingField("confirmations"),
            ),
            (
                "SUBMIT ACCIDENT 1 2 2012-05-03T14:22:01.123+0000 -1",
                ProtocolError::InvalidNumber {
                    field: "confirmations",
                    value: "-1".to_string(),
                },
            ),
            (
                "NOT_SEEN ACCIDENT 1 2 2012-05-03T14:22:01.123+0000 0",
                ProtocolError::TrailingField("0".to_string()),
            ),
        ];

        for (line, expected) in cases {
            assert_eq!(Request::parse(line), Err(expected), "line: {:?}", line);
        }
    }

    #[test]
    fn test_encode_requests() {
        let poi = PoiType::MobileSpeedCam.construct(50.0, -1.25, sample_date(), 2);
        assert_eq!(
            Request::Submit(poi.clone()).encode(),
            "SUBMIT MOBILE_SPEED_CAM 50.0 -1.25 2012-05-03T14:22:01.123+0000 2"
        );
        assert_eq!(
            Request::NotSeen(poi).encode(),
            "NOT_SEEN MOBILE_SPEED_CAM 50.0 -1.25 2012-05-03T14:22:01.123+0000"
        );
        assert_eq!(
            Request::GetInfos {
                latitude: 48.8566,
                longitude: 2.3522
            }
            .encode(),
            "GET_INFOS 48.8566 2.3522"
        );
    }

    #[test]
    fn test_encoded_request_parses_back() {
        let poi = PoiType::FixedSpeedCam.construct(43.604652, 1.444209, sample_date(), 0);
        let parsed = Request::parse(&Request::NotSeen(poi.clone()).encode()).unwrap();
        match parsed {
            Request::NotSeen(decoded) => assert!(decoded.same_report(&poi)),
            other => panic!("Unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_encode_infos() {
        let poi = PoiType::Accident.construct(48.8566, 2.3522, sample_date(), 3);
        assert_eq!(
            encode_infos(&[poi]),
            vec![
                "INFOS 1".to_string(),
                "INFO ACCIDENT 48.8566 2.3522 2012-05-03T14:22:01.123+0000 3".to_string(),
            ]
        );
        assert_eq!(encode_infos(&[]), vec!["INFOS 0".to_string()]);
    }

    #[test]
    fn test_decode_infos() {
        let lines = vec![
            "INFOS 2",
            "INFO ACCIDENT 48.8566 2.3522 2012-05-03T14:22:01.123+0000 3",
            "INFO ROADWORKS 48.85 2.35 2012-05-03T14:22:01.123+0000 0",
        ];
        let pois = decode_infos(lines).unwrap();
        assert_eq!(pois.len(), 2);
        assert_eq!(pois[0].confirmations(), 3);
        assert_eq!(pois[1].poi_type(), PoiType::Roadworks);
    }

    #[test]
    fn test_decode_infos_count_mismatch() {
        let short = vec!["INFOS 2", "INFO ACCIDENT 1.0 2.0 2012-05-03T14:22:01.123+0000 3"];
        assert_eq!(
            decode_infos(short),
            Err(ProtocolError::CountMismatch {
                announced: 2,
                received: 1
            })
        );

        let long = vec![
            "INFOS 0",
            "INFO ACCIDENT 1.0 2.0 2012-05-03T14:22:01.123+0000 3",
        ];
        assert_eq!(
            decode_infos(long),
            Err(ProtocolError::CountMismatch {
                announced: 0,
                received: 1
            })
        );
    }

    #[test]
    fn test_decode_infos_bad_header() {
        assert!(matches!(
            decode_infos(vec!["INFO 1"]),
            Err(ProtocolError::UnexpectedLine { expected: INFOS, .. })
        ));
        assert!(matches!(
            decode_infos(vec!["INFOS many"]),
            Err(ProtocolError::InvalidNumber { .. })
        ));
        assert!(matches!(
            decode_infos(Vec::<String>::new()),
            Err(ProtocolError::MissingField(_))
        ));
    }

    #[test]
    fn test_format_number_is_locale_free() {
        assert_eq!(format_number(48.8566), "48.8566");
        assert_eq!(format_number(50.0), "50.0");
        assert_eq!(format_number(-0.1278), "-0.1278");
        assert_eq!(format_number(0.00001), "0.00001");
    }
}
