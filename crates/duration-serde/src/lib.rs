//! Serde helpers for `std::time::Duration` fields.
//! Durations can be expressed either as humantime strings like "20 minutes"
//! or as a bare number of seconds (integer or float).
//! Use via `#[serde(with = "duration_serde")]`; both `Duration` and
//! `Option<Duration>` fields are supported.
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

pub struct Wrap<T>(T);

pub fn serialize<T, S>(d: &T, s: S) -> Result<S::Ok, S::Error>
where
    for<'a> Wrap<&'a T>: Serialize,
    S: Serializer,
{
    Wrap(d).serialize(s)
}

pub fn deserialize<'de, T, D>(d: D) -> Result<T, D::Error>
where
    Wrap<T>: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Wrap::deserialize(d).map(|w| w.0)
}

struct DurationVisitor;

impl<'de> serde::de::Visitor<'de> for DurationVisitor {
    type Value = Duration;

    fn expecting(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.write_str("a duration string or a number of seconds")
    }

    fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Duration, E> {
        Ok(Duration::from_secs(v))
    }

    fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Duration, E> {
        u64::try_from(v)
            .map(Duration::from_secs)
            .map_err(|_| E::custom("duration seconds must not be negative"))
    }

    fn visit_f64<E: serde::de::Error>(self, v: f64) -> Result<Duration, E> {
        if v < 0.0 {
            return Err(E::custom("duration seconds must not be negative"));
        }
        Ok(Duration::from_secs_f64(v))
    }

    fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Duration, E> {
        humantime::parse_duration(v)
            .map_err(|_| E::invalid_value(serde::de::Unexpected::Str(v), &self))
    }
}

impl<'de> Deserialize<'de> for Wrap<Duration> {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        d.deserialize_any(DurationVisitor).map(Wrap)
    }
}

impl<'de> Deserialize<'de> for Wrap<Option<Duration>> {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        Ok(Wrap(
            Option::<Wrap<Duration>>::deserialize(d)?.map(|w| w.0),
        ))
    }
}

impl Serialize for Wrap<&Duration> {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        humantime::format_duration(*self.0).to_string().serialize(s)
    }
}

impl Serialize for Wrap<&Option<Duration>> {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            Some(d) => Wrap(d).serialize(s),
            None => s.serialize_none(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Deserialize, Serialize, Debug, PartialEq)]
    struct Demo {
        #[serde(with = "crate")]
        interval: Duration,
        #[serde(default, with = "crate")]
        cap: Option<Duration>,
    }

    #[test]
    fn parse_variants() {
        let d: Demo = serde_json::from_str(r#"{"interval":"20 minutes"}"#).unwrap();
        assert_eq!(d.interval, Duration::from_secs(20 * 60));
        assert_eq!(d.cap, None);

        let d: Demo = serde_json::from_str(r#"{"interval":90,"cap":"1h"}"#).unwrap();
        assert_eq!(d.interval, Duration::from_secs(90));
        assert_eq!(d.cap, Some(Duration::from_secs(3600)));
    }

    #[test]
    fn round_trip() {
        let d = Demo {
            interval: Duration::from_secs(1200),
            cap: Some(Duration::from_secs(72000)),
        };
        let s = serde_json::to_string(&d).unwrap();
        assert_eq!(s, r#"{"interval":"20m","cap":"20h"}"#);
        let back: Demo = serde_json::from_str(&s).unwrap();
        assert_eq!(back, d);
    }
}
