//! Value types shared by every component: timestamps, tri-state settings,
//! opaque JSON configuration and the tagged field values held in document data.
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::collections::BTreeMap;

/// Header or line data keyed by `field_key`.
pub type Record = BTreeMap<String, FieldValue>;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct TimeStamp(DateTime<Utc>);

impl TimeStamp {
    pub fn now() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Option<Self> {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .map(Self)
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    /// Nanoseconds since the epoch, clamped at zero. Used for history keys so
    /// that byte order matches chronological order.
    pub fn sort_key(&self) -> u64 {
        self.0.timestamp_nanos_opt().unwrap_or_default().max(0) as u64
    }
}

impl From<DateTime<Utc>> for TimeStamp {
    fn from(value: DateTime<Utc>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

/// Opaque JSON configuration (`settings`, `permission_config`, ...). Stored as
/// JSON text inside the CBOR record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Json(pub serde_json::Value);

impl Json {
    pub fn empty_object() -> Self {
        Json(serde_json::Value::Object(serde_json::Map::new()))
    }
}

impl From<serde_json::Value> for Json {
    fn from(value: serde_json::Value) -> Self {
        Json(value)
    }
}

impl<C> minicbor::Encode<C> for Json {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        let text = serde_json::to_string(&self.0)
            .map_err(minicbor::encode::Error::<W::Error>::message)?;
        e.str(&text)?.ok()
    }
}

impl<'b, C> minicbor::Decode<'b, C> for Json {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let text = d.str()?;
        serde_json::from_str(text)
            .map(Json)
            .map_err(minicbor::decode::Error::message)
    }
}

/// Tri-state optional attribute.
///
/// `Unset` only appears in inputs and patches ("not supplied"). `Null` is the
/// stored absent-value marker and `Value` carries the configured value.
#[derive(Debug, Clone, PartialEq, Default, minicbor::Encode, minicbor::Decode)]
pub enum Setting<T> {
    #[default]
    #[n(0)]
    Unset,
    #[n(1)]
    Null,
    #[n(2)]
    Value(#[n(0)] T),
}

impl<T> Setting<T> {
    pub fn is_value(&self) -> bool {
        matches!(self, Setting::Value(_))
    }

    pub fn as_value(&self) -> Option<&T> {
        match self {
            Setting::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Resolves an omitted input to the stored absent marker.
    pub fn or_null(self) -> Self {
        match self {
            Setting::Unset => Setting::Null,
            other => other,
        }
    }

    /// Applies a patch value on top of `current`; `Unset` keeps `current`.
    pub fn patch(self, current: Setting<T>) -> Setting<T> {
        match self {
            Setting::Unset => current,
            other => other,
        }
    }

    /// Same as [`Setting::patch`] for attributes stored as a plain `Option`.
    pub fn patch_option(self, current: Option<T>) -> Option<T> {
        match self {
            Setting::Unset => current,
            Setting::Null => None,
            Setting::Value(v) => Some(v),
        }
    }
}

impl<T> From<Option<T>> for Setting<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Setting::Value(v),
            None => Setting::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct FileRef {
    #[n(0)]
    pub name: String,
    #[n(1)]
    pub url: String,
}

/// A single field value inside document data.
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub enum FieldValue {
    #[n(0)]
    Text(#[n(0)] String),
    #[n(1)]
    Number(#[n(0)] f64),
    #[n(2)]
    Bool(#[n(0)] bool),
    #[n(3)]
    Date(#[n(0)] TimeStamp),
    #[n(4)]
    File(#[n(0)] FileRef),
}

impl FieldValue {
    pub fn text(value: impl Into<String>) -> Self {
        FieldValue::Text(value.into())
    }

    /// Converts a JSON value coming from an outer layer. `null` means absent.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        use serde_json::Value;

        match value {
            Value::Null => None,
            Value::Bool(b) => Some(FieldValue::Bool(*b)),
            Value::Number(n) => n.as_f64().map(FieldValue::Number),
            Value::String(s) => Some(FieldValue::Text(s.clone())),
            Value::Object(map) => match (map.get("name"), map.get("url")) {
                (Some(Value::String(name)), Some(Value::String(url))) => {
                    Some(FieldValue::File(FileRef {
                        name: name.clone(),
                        url: url.clone(),
                    }))
                }
                _ => Some(FieldValue::Text(value.to_string())),
            },
            Value::Array(_) => Some(FieldValue::Text(value.to_string())),
        }
    }

    /// Converts a JSON object into a record, dropping `null` members.
    pub fn record_from_json(value: &serde_json::Value) -> Record {
        value
            .as_object()
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| FieldValue::from_json(v).map(|fv| (k.clone(), fv)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// True for values the `required` rule treats as missing.
    pub fn is_blank(&self) -> bool {
        match self {
            FieldValue::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            FieldValue::Text(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            FieldValue::Text(s) => match s.trim() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Accepts `YYYY-MM-DD` (midnight UTC) or RFC 3339 text.
    pub fn as_date(&self) -> Option<TimeStamp> {
        match self {
            FieldValue::Date(ts) => Some(*ts),
            FieldValue::Text(s) => parse_date(s.trim()),
            _ => None,
        }
    }
}

fn parse_date(s: &str) -> Option<TimeStamp> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(TimeStamp(dt.with_timezone(&Utc)));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| TimeStamp(naive.and_utc()))
}
