//! Calendar and agenda core for frontmatter-backed note collections.
//! The pipeline stays pure: records go in, freshly allocated projections come out,
//! and every lossy step degrades softly instead of failing.

pub mod model {
    //! Record values, calendar configuration and the processed event shapes shared by
    //! the processor, the filter engine and the duplicate workflow.

    use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
    use indexmap::IndexMap;
    use once_cell::sync::Lazy;
    use regex::Regex;
    use serde::{Deserialize, Serialize};
    use serde_with::skip_serializing_none;
    use std::{collections::BTreeMap, ops::Range, sync::Arc};

    /* ------------------------------ Values ------------------------------ */

    /// A frontmatter value as delivered by the data source.
    ///
    /// Deserialization is untagged, so JSON strings always land in `Text`; `Date` is
    /// reserved for hosts that hand over already-typed timestamps.
    #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
    #[serde(untagged)]
    pub enum Value {
        #[default]
        Null,
        Bool(bool),
        Number(f64),
        Text(String),
        List(Vec<String>),
        Date(NaiveDateTime),
    }

    impl Value {
        /// Null, empty string and empty list all count as empty.
        pub fn is_empty(&self) -> bool {
            match self {
                Value::Null => true,
                Value::Text(s) => s.is_empty(),
                Value::List(xs) => xs.is_empty(),
                _ => false,
            }
        }

        pub fn to_text(&self) -> Option<String> {
            match self {
                Value::Null => None,
                Value::Bool(b) => Some(b.to_string()),
                Value::Number(n) => Some(n.to_string()),
                Value::Text(s) => Some(s.clone()),
                Value::List(xs) => Some(xs.join(", ")),
                Value::Date(at) => Some(format_instant(*at)),
            }
        }

        /// Permissive numeric coercion. Anything that does not read as a number is `None`,
        /// which callers treat as a failed comparison.
        pub fn to_number(&self) -> Option<f64> {
            match self {
                Value::Number(n) if !n.is_nan() => Some(*n),
                Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
                Value::Text(s) => parse_number(s),
                _ => None,
            }
        }

        /// Interpret the value as a date, optionally shifting offset-bearing instants into `tz`.
        pub fn to_date_like(&self, tz: Option<FixedOffset>) -> Option<DateLike> {
            match self {
                Value::Date(at) => Some(DateLike {
                    at: *at,
                    has_time: at.time() != NaiveTime::MIN,
                }),
                Value::Text(s) => parse_date_text(&strip_wiki_link(s), tz),
                Value::Number(ms) => from_epoch_millis(*ms, tz),
                _ => None,
            }
        }

        /// Scalars become a one-element list; null becomes an empty one.
        pub fn as_list(&self) -> Vec<String> {
            match self {
                Value::Null => vec![],
                Value::List(xs) => xs.clone(),
                other => other.to_text().into_iter().collect(),
            }
        }
    }

    impl From<&str> for Value {
        fn from(s: &str) -> Self {
            Value::Text(s.to_string())
        }
    }

    impl From<String> for Value {
        fn from(s: String) -> Self {
            Value::Text(s)
        }
    }

    impl From<f64> for Value {
        fn from(n: f64) -> Self {
            Value::Number(n)
        }
    }

    impl From<bool> for Value {
        fn from(b: bool) -> Self {
            Value::Bool(b)
        }
    }

    impl From<Vec<&str>> for Value {
        fn from(xs: Vec<&str>) -> Self {
            Value::List(xs.into_iter().map(str::to_string).collect())
        }
    }

    impl From<NaiveDateTime> for Value {
        fn from(at: NaiveDateTime) -> Self {
            Value::Date(at)
        }
    }

    /* ------------------------------ Coercions ------------------------------ */

    static EMBEDDED_TIME: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"\d{2}:\d{2}").expect("embedded time pattern compiles"));

    const DATETIME_FORMATS: &[&str] = &[
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
    ];

    const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d"];

    const TIME_FORMATS: &[&str] = &["%H:%M:%S", "%H:%M", "%I:%M %p", "%I:%M%p"];

    /// A parsed date plus whether the source carried a time of day.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DateLike {
        pub at: NaiveDateTime,
        pub has_time: bool,
    }

    impl DateLike {
        pub fn day(&self) -> NaiveDate {
            self.at.date()
        }
    }

    pub fn has_embedded_time(raw: &str) -> bool {
        EMBEDDED_TIME.is_match(raw)
    }

    /// Parse the date shapes found in frontmatter: ISO dates, local date-times and RFC 3339.
    pub fn parse_date_text(raw: &str, tz: Option<FixedOffset>) -> Option<DateLike> {
        let text = raw.trim();
        if text.is_empty() {
            return None;
        }
        let has_time = has_embedded_time(text);

        if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
            let at = match tz {
                Some(offset) => dt.with_timezone(&offset).naive_local(),
                None => dt.naive_local(),
            };
            return Some(DateLike { at, has_time });
        }
        for fmt in DATETIME_FORMATS {
            if let Ok(at) = NaiveDateTime::parse_from_str(text, fmt) {
                return Some(DateLike { at, has_time });
            }
        }
        for fmt in DATE_FORMATS {
            if let Ok(day) = NaiveDate::parse_from_str(text, fmt) {
                return Some(DateLike {
                    at: day.and_time(NaiveTime::MIN),
                    has_time: false,
                });
            }
        }
        None
    }

    /// Time-of-day from a dedicated time field (`09:30`, `9:30 pm`, or a full timestamp).
    pub fn parse_time_of_day(raw: &str) -> Option<NaiveTime> {
        let text = raw.trim();
        TIME_FORMATS
            .iter()
            .find_map(|fmt| NaiveTime::parse_from_str(text, fmt).ok())
            .or_else(|| {
                parse_date_text(text, None)
                    .filter(|d| d.has_time)
                    .map(|d| d.at.time())
            })
    }

    pub fn parse_number(raw: &str) -> Option<f64> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        trimmed.parse::<f64>().ok().filter(|n| !n.is_nan())
    }

    fn from_epoch_millis(ms: f64, tz: Option<FixedOffset>) -> Option<DateLike> {
        if !ms.is_finite() {
            return None;
        }
        let utc = DateTime::from_timestamp_millis(ms as i64)?;
        let at = match tz {
            Some(offset) => utc.with_timezone(&offset).naive_local(),
            None => utc.naive_utc(),
        };
        Some(DateLike { at, has_time: false })
    }

    /// `[[path|display]]` → `display`, `[[path]]` → `path`; anything else is returned trimmed.
    pub fn strip_wiki_link(raw: &str) -> String {
        let text = raw.trim();
        match text.strip_prefix("[[").and_then(|s| s.strip_suffix("]]")) {
            Some(inner) => match inner.split_once('|') {
                Some((_, display)) => display.to_string(),
                None => inner.to_string(),
            },
            None => text.to_string(),
        }
    }

    pub fn date_key(day: NaiveDate) -> String {
        day.format("%Y-%m-%d").to_string()
    }

    pub fn parse_date_key(key: &str) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(key.trim(), "%Y-%m-%d").ok()
    }

    fn format_instant(at: NaiveDateTime) -> String {
        if at.time() == NaiveTime::MIN {
            date_key(at.date())
        } else {
            at.format("%Y-%m-%dT%H:%M:%S").to_string()
        }
    }

    /* ------------------------------ Records ------------------------------ */

    /// A note projected as a row of frontmatter fields. Owned by the data source.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct DataRecord {
        pub id: String,
        #[serde(default)]
        pub values: IndexMap<String, Value>,
    }

    impl DataRecord {
        pub fn new(id: impl Into<String>) -> Self {
            Self {
                id: id.into(),
                values: IndexMap::new(),
            }
        }

        pub fn with_value(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
            self.values.insert(field.into(), value.into());
            self
        }

        pub fn get(&self, field: &str) -> Option<&Value> {
            self.values.get(field)
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct FieldDescriptor {
        pub name: String,
        #[serde(default, rename = "type")]
        pub kind: Option<String>,
    }

    /// Input snapshot from the data-source layer.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub struct DataFrame {
        #[serde(default)]
        pub fields: Vec<FieldDescriptor>,
        #[serde(default)]
        pub records: Vec<Arc<DataRecord>>,
    }

    impl DataFrame {
        pub fn from_records(records: impl IntoIterator<Item = DataRecord>) -> Self {
            Self {
                fields: vec![],
                records: records.into_iter().map(Arc::new).collect(),
            }
        }
    }

    /* ---------------------------- Configuration ---------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum DisplayMode {
        #[default]
        Headers,
        Bars,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub enum TimeFormat {
        #[default]
        #[serde(rename = "24h")]
        TwentyFourHour,
        #[serde(rename = "12h")]
        TwelveHour,
    }

    /// Calendar view options. Every field is optional in the persisted JSON.
    #[skip_serializing_none]
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    pub struct CalendarConfig {
        pub start_date_field: Option<String>,
        pub end_date_field: Option<String>,
        pub start_time_field: Option<String>,
        pub end_time_field: Option<String>,
        pub event_color_field: Option<String>,
        /// Legacy single date field, consulted when `start_date_field` is unset.
        pub date_field: Option<String>,
        pub start_hour: u32,
        pub end_hour: u32,
        /// Offset applied to instants that carry their own zone (seconds east of UTC).
        #[serde(with = "serde_fixed_offset_opt")]
        pub timezone: Option<FixedOffset>,
        pub display_mode: DisplayMode,
        pub time_format: TimeFormat,
    }

    impl Default for CalendarConfig {
        fn default() -> Self {
            Self {
                start_date_field: None,
                end_date_field: None,
                start_time_field: None,
                end_time_field: None,
                event_color_field: None,
                date_field: None,
                start_hour: 0,
                end_hour: 24,
                timezone: None,
                display_mode: DisplayMode::default(),
                time_format: TimeFormat::default(),
            }
        }
    }

    impl CalendarConfig {
        pub fn start_time_field(&self) -> &str {
            non_empty(&self.start_time_field).unwrap_or("startTime")
        }

        pub fn end_time_field(&self) -> &str {
            non_empty(&self.end_time_field).unwrap_or("endTime")
        }

        /// Hours shown on the timeline; always non-empty and within a single day.
        pub fn visible_hours(&self) -> Range<u32> {
            let start = self.start_hour.min(23);
            let end = self.end_hour.clamp(start + 1, 24);
            start..end
        }

        pub fn format_time(&self, time: NaiveTime) -> String {
            match self.time_format {
                TimeFormat::TwentyFourHour => time.format("%H:%M").to_string(),
                TimeFormat::TwelveHour => time.format("%-I:%M %p").to_string(),
            }
        }
    }

    pub(crate) fn non_empty(field: &Option<String>) -> Option<&str> {
        field.as_deref().map(str::trim).filter(|f| !f.is_empty())
    }

    mod serde_fixed_offset_opt {
        use chrono::FixedOffset;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S>(value: &Option<FixedOffset>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match value {
                Some(offset) => serializer.serialize_some(&offset.local_minus_utc()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<FixedOffset>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let opt = Option::<i32>::deserialize(deserializer)?;
            Ok(opt.and_then(FixedOffset::east_opt))
        }
    }

    /* --------------------------- Processed events --------------------------- */

    /// Layout classification; a pure function of (multi-day, has time).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
    pub enum RenderType {
        AllDay,
        Timed,
        MultiDayAllday,
        MultiDayTimed,
    }

    impl RenderType {
        pub fn classify(multi_day: bool, has_time: bool) -> Self {
            match (multi_day, has_time) {
                (false, false) => RenderType::AllDay,
                (false, true) => RenderType::Timed,
                (true, false) => RenderType::MultiDayAllday,
                (true, true) => RenderType::MultiDayTimed,
            }
        }

        /// Header events are stacked in lanes; only single-day timed events go on the timeline.
        pub fn is_header(self) -> bool {
            !matches!(self, RenderType::Timed)
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct TimeInfo {
        pub start_time: NaiveDateTime,
        pub end_time: NaiveDateTime,
        pub duration_minutes: i64,
        pub has_embedded_time: bool,
    }

    /// Inclusive day span of a multi-day event; `span_days >= 2`.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct SpanInfo {
        pub start_date: NaiveDate,
        pub end_date: NaiveDate,
        pub span_days: u32,
    }

    /// A record normalized for calendar rendering. Recomputed on every `process` call.
    #[derive(Debug, Clone, PartialEq, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ProcessedRecord {
        pub record: Arc<DataRecord>,
        pub render_type: RenderType,
        pub start_date: NaiveDate,
        pub end_date: NaiveDate,
        pub time_info: Option<TimeInfo>,
        pub span_info: Option<SpanInfo>,
        pub color: Option<String>,
        pub lane: usize,
        /// Preview-only clone produced by the duplicate workflow.
        #[serde(skip)]
        pub is_phantom: bool,
    }

    impl ProcessedRecord {
        pub fn id(&self) -> &str {
            &self.record.id
        }

        pub fn span_days(&self) -> u32 {
            self.span_info.as_ref().map(|s| s.span_days).unwrap_or(1)
        }

        /// Every calendar day from start through end, inclusive.
        pub fn days(&self) -> impl Iterator<Item = NaiveDate> + '_ {
            self.start_date
                .iter_days()
                .take_while(move |day| *day <= self.end_date)
        }

        pub fn covers(&self, day: NaiveDate) -> bool {
            self.start_date <= day && day <= self.end_date
        }
    }

    /// Output of the calendar processor. `grouped` replicates multi-day events into
    /// every day they cover, so it is not a partition of `processed`.
    #[derive(Debug, Clone, Default, PartialEq, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ProcessedCalendarData {
        pub processed: Vec<ProcessedRecord>,
        pub grouped: BTreeMap<String, Vec<ProcessedRecord>>,
        pub index: IndexMap<String, ProcessedRecord>,
        pub max_lane: usize,
    }

    impl ProcessedCalendarData {
        pub fn events_on(&self, day: NaiveDate) -> &[ProcessedRecord] {
            self.grouped
                .get(&date_key(day))
                .map(Vec::as_slice)
                .unwrap_or(&[])
        }

        /// All-day and multi-day events for `day`, ordered by lane.
        pub fn header_events_on(&self, day: NaiveDate) -> Vec<&ProcessedRecord> {
            let mut events: Vec<_> = self
                .events_on(day)
                .iter()
                .filter(|e| e.render_type.is_header())
                .collect();
            events.sort_by_key(|e| e.lane);
            events
        }

        /// Single-day timed events for `day`, ordered by start time.
        pub fn timed_events_on(&self, day: NaiveDate) -> Vec<&ProcessedRecord> {
            let mut events: Vec<_> = self
                .events_on(day)
                .iter()
                .filter(|e| !e.render_type.is_header())
                .collect();
            events.sort_by_key(|e| e.time_info.as_ref().map(|t| t.start_time));
            events
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn wiki_links_unwrap_to_display_or_path() {
            assert_eq!(strip_wiki_link("[[Projects/Alpha|Alpha]]"), "Alpha");
            assert_eq!(strip_wiki_link("[[2026-02-07]]"), "2026-02-07");
            assert_eq!(strip_wiki_link("  plain "), "plain");
            assert_eq!(strip_wiki_link("[[unterminated"), "[[unterminated");
        }

        #[test]
        fn number_coercion_fails_closed_on_blank_text() {
            assert_eq!(Value::from("  ").to_number(), None);
            assert_eq!(Value::from("").to_number(), None);
            assert_eq!(Value::from(" 42 ").to_number(), Some(42.0));
            assert_eq!(Value::Bool(true).to_number(), Some(1.0));
            assert_eq!(Value::from("abc").to_number(), None);
            assert_eq!(Value::Null.to_number(), None);
        }

        #[test]
        fn date_text_detects_embedded_time() {
            let day = parse_date_text("2026-02-07", None).expect("date");
            assert!(!day.has_time);
            assert_eq!(day.day(), NaiveDate::from_ymd_opt(2026, 2, 7).unwrap());

            let timed = parse_date_text("2026-02-07T09:30", None).expect("datetime");
            assert!(timed.has_time);
            assert_eq!(timed.at.time(), NaiveTime::from_hms_opt(9, 30, 0).unwrap());

            let spaced = parse_date_text("2026-02-07 18:05:10", None).expect("datetime");
            assert_eq!(spaced.at.time(), NaiveTime::from_hms_opt(18, 5, 10).unwrap());

            assert!(parse_date_text("next tuesday", None).is_none());
            assert!(parse_date_text("", None).is_none());
        }

        #[test]
        fn rfc3339_instants_shift_into_configured_offset() {
            let tz = FixedOffset::east_opt(2 * 3600);
            let shifted = parse_date_text("2026-02-07T23:30:00Z", tz).expect("rfc3339");
            assert_eq!(shifted.day(), NaiveDate::from_ymd_opt(2026, 2, 8).unwrap());
            assert_eq!(shifted.at.time(), NaiveTime::from_hms_opt(1, 30, 0).unwrap());

            let as_written = parse_date_text("2026-02-07T23:30:00Z", None).expect("rfc3339");
            assert_eq!(as_written.day(), NaiveDate::from_ymd_opt(2026, 2, 7).unwrap());
        }

        #[test]
        fn time_fields_accept_24h_and_12h() {
            let t = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap();
            assert_eq!(parse_time_of_day("09:30"), Some(t(9, 30)));
            assert_eq!(parse_time_of_day("9:30 PM"), Some(t(21, 30)));
            assert_eq!(parse_time_of_day("2026-02-07T14:00"), Some(t(14, 0)));
            assert_eq!(parse_time_of_day("noon"), None);
        }

        #[test]
        fn config_deserializes_from_camel_case_with_defaults() {
            let config: CalendarConfig = serde_json::from_str(
                r#"{"startDateField":"begins","timezone":3600,"timeFormat":"12h"}"#,
            )
            .expect("config json");
            assert_eq!(config.start_date_field.as_deref(), Some("begins"));
            assert_eq!(config.timezone, FixedOffset::east_opt(3600));
            assert_eq!(config.end_hour, 24);
            assert_eq!(config.display_mode, DisplayMode::Headers);
            assert_eq!(config.start_time_field(), "startTime");
            assert_eq!(
                config.format_time(NaiveTime::from_hms_opt(15, 5, 0).unwrap()),
                "3:05 PM"
            );
        }

        #[test]
        fn visible_hours_never_collapse() {
            let config = CalendarConfig {
                start_hour: 30,
                end_hour: 2,
                ..CalendarConfig::default()
            };
            assert_eq!(config.visible_hours(), 23..24);
        }

        #[test]
        fn record_values_deserialize_untagged() {
            let record: DataRecord = serde_json::from_str(
                r#"{"id":"a","values":{"done":true,"points":3,"tags":["x","y"],"due":"2026-02-07","note":null}}"#,
            )
            .expect("record json");
            assert_eq!(record.get("done"), Some(&Value::Bool(true)));
            assert_eq!(record.get("points"), Some(&Value::Number(3.0)));
            assert_eq!(record.get("tags"), Some(&Value::from(vec!["x", "y"])));
            assert_eq!(record.get("due"), Some(&Value::from("2026-02-07")));
            assert_eq!(record.get("note"), Some(&Value::Null));
        }
    }
}

pub mod logging {
    //! Injected logging capability. Components receive an `Arc<dyn CalendarLogger>` at
    //! construction; the host decides whether messages reach the `log` facade, a capture
    //! buffer, or nowhere.

    use std::sync::{Arc, Mutex};

    pub const LOG_TARGET: &str = "notecal";

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub enum LogLevel {
        Debug,
        Info,
        Warn,
        Error,
    }

    impl From<LogLevel> for log::Level {
        fn from(level: LogLevel) -> Self {
            match level {
                LogLevel::Debug => log::Level::Debug,
                LogLevel::Info => log::Level::Info,
                LogLevel::Warn => log::Level::Warn,
                LogLevel::Error => log::Level::Error,
            }
        }
    }

    pub trait CalendarLogger: Send + Sync {
        fn log(&self, level: LogLevel, message: &str);

        fn debug(&self, message: &str) {
            self.log(LogLevel::Debug, message);
        }

        fn info(&self, message: &str) {
            self.log(LogLevel::Info, message);
        }

        fn warn(&self, message: &str) {
            self.log(LogLevel::Warn, message);
        }

        fn error(&self, message: &str) {
            self.log(LogLevel::Error, message);
        }
    }

    /// Forwards to the `log` crate; the installed backend decides filtering.
    #[derive(Debug, Clone, Copy)]
    pub struct LogFacade {
        target: &'static str,
    }

    impl LogFacade {
        pub fn new(target: &'static str) -> Self {
            Self { target }
        }
    }

    impl Default for LogFacade {
        fn default() -> Self {
            Self::new(LOG_TARGET)
        }
    }

    impl CalendarLogger for LogFacade {
        fn log(&self, level: LogLevel, message: &str) {
            let level: log::Level = level.into();
            log::log!(target: self.target, level, "{message}");
        }
    }

    #[derive(Debug, Clone, Copy, Default)]
    pub struct NoopLogger;

    impl CalendarLogger for NoopLogger {
        fn log(&self, _level: LogLevel, _message: &str) {}
    }

    /// Keeps every message in memory, for hosts that surface diagnostics themselves.
    #[derive(Debug, Default)]
    pub struct RecordingLogger {
        entries: Mutex<Vec<(LogLevel, String)>>,
    }

    impl RecordingLogger {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn entries(&self) -> Vec<(LogLevel, String)> {
            self.entries
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone()
        }

        pub fn messages_at(&self, level: LogLevel) -> Vec<String> {
            self.entries()
                .into_iter()
                .filter(|(l, _)| *l == level)
                .map(|(_, m)| m)
                .collect()
        }
    }

    impl CalendarLogger for RecordingLogger {
        fn log(&self, level: LogLevel, message: &str) {
            self.entries
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push((level, message.to_string()));
        }
    }

    pub fn default_logger() -> Arc<dyn CalendarLogger> {
        Arc::new(LogFacade::default())
    }

}

pub mod formula {
    //! Relative date formulas such as `today`, `sow+1w` or `eom-1m`.
    //!
    //! Grammar: `keyword (('+' | '-') integer unit?)?` with `unit ∈ {d, w, m, y}` (default `d`).
    //! Keywords are case-insensitive and accept both the short Dataview spellings
    //! (`sow`, `eom`, ...) and verbose aliases (`start_of_week`, `monthend`, ...).

    use chrono::{Datelike, Days, Months, NaiveDate, Weekday};
    use nom::{
        IResult,
        bytes::complete::take_while1,
        character::complete::{digit1, one_of, space0},
        combinator::{all_consuming, map_res, opt},
        error::VerboseError,
        sequence::tuple,
    };

    /* ------------------------------ Keywords ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Anchor {
        Today,
        Tomorrow,
        Yesterday,
        WeekStart,
        WeekEnd,
        MonthStart,
        MonthEnd,
        YearStart,
        YearEnd,
    }

    const KEYWORD_ALIASES: &[(&str, Anchor)] = &[
        ("today", Anchor::Today),
        ("now", Anchor::Today),
        ("tomorrow", Anchor::Tomorrow),
        ("yesterday", Anchor::Yesterday),
        ("sow", Anchor::WeekStart),
        ("week_start", Anchor::WeekStart),
        ("start_of_week", Anchor::WeekStart),
        ("startofweek", Anchor::WeekStart),
        ("weekstart", Anchor::WeekStart),
        ("eow", Anchor::WeekEnd),
        ("week_end", Anchor::WeekEnd),
        ("end_of_week", Anchor::WeekEnd),
        ("endofweek", Anchor::WeekEnd),
        ("weekend", Anchor::WeekEnd),
        ("som", Anchor::MonthStart),
        ("month_start", Anchor::MonthStart),
        ("start_of_month", Anchor::MonthStart),
        ("startofmonth", Anchor::MonthStart),
        ("monthstart", Anchor::MonthStart),
        ("eom", Anchor::MonthEnd),
        ("month_end", Anchor::MonthEnd),
        ("end_of_month", Anchor::MonthEnd),
        ("endofmonth", Anchor::MonthEnd),
        ("monthend", Anchor::MonthEnd),
        ("soy", Anchor::YearStart),
        ("year_start", Anchor::YearStart),
        ("start_of_year", Anchor::YearStart),
        ("startofyear", Anchor::YearStart),
        ("yearstart", Anchor::YearStart),
        ("eoy", Anchor::YearEnd),
        ("year_end", Anchor::YearEnd),
        ("end_of_year", Anchor::YearEnd),
        ("endofyear", Anchor::YearEnd),
        ("yearend", Anchor::YearEnd),
    ];

    pub fn supported_keywords() -> Vec<String> {
        KEYWORD_ALIASES
            .iter()
            .map(|(alias, _)| alias.to_string())
            .collect()
    }

    fn lookup_anchor(word: &str) -> Option<Anchor> {
        KEYWORD_ALIASES
            .iter()
            .find(|(alias, _)| *alias == word)
            .map(|(_, anchor)| *anchor)
    }

    /// Cheap check used before formula resolution: an exact alias, or an alias
    /// followed by a signed offset.
    pub fn is_date_formula(value: &str) -> bool {
        let normalized = value.trim().to_ascii_lowercase();
        KEYWORD_ALIASES.iter().any(|(alias, _)| {
            normalized.strip_prefix(alias).is_some_and(|rest| {
                rest.is_empty() || rest.trim_start().starts_with(['+', '-'])
            })
        })
    }

    /* ------------------------------ Syntax ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum OffsetUnit {
        Days,
        Weeks,
        Months,
        Years,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DateFormula {
        pub anchor: Anchor,
        pub offset: i64,
        pub unit: OffsetUnit,
    }

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum FormulaError {
        #[error("date formula is empty")]
        Empty,
        #[error("unknown keyword `{keyword}` (supported: {})", .supported.join(", "))]
        UnknownKeyword {
            keyword: String,
            supported: Vec<String>,
        },
        #[error("invalid date formula `{formula}`: {detail}")]
        Syntax { formula: String, detail: String },
        #[error("date formula `{0}` resolves outside the supported calendar range")]
        OutOfRange(String),
    }

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    fn keyword(i: &str) -> PResult<'_, &str> {
        take_while1(|c: char| c.is_ascii_alphabetic() || c == '_')(i)
    }

    fn offset(i: &str) -> PResult<'_, (i64, OffsetUnit)> {
        let (i, (_, sign, _, magnitude, unit, _)) = tuple((
            space0,
            one_of("+-"),
            space0,
            map_res(digit1, |s: &str| s.parse::<i64>()),
            opt(one_of("dwmy")),
            space0,
        ))(i)?;
        let signed = if sign == '-' { -magnitude } else { magnitude };
        let unit = match unit {
            Some('w') => OffsetUnit::Weeks,
            Some('m') => OffsetUnit::Months,
            Some('y') => OffsetUnit::Years,
            _ => OffsetUnit::Days,
        };
        Ok((i, (signed, unit)))
    }

    /// Parse without resolving. Keyword lookup happens before offset parsing so an
    /// unknown keyword is reported as such even when the offset is also malformed.
    pub fn parse_formula(formula: &str) -> Result<DateFormula, FormulaError> {
        let trimmed = formula.trim();
        if trimmed.is_empty() {
            return Err(FormulaError::Empty);
        }
        let normalized = trimmed.to_ascii_lowercase();
        let syntax = |detail: String| FormulaError::Syntax {
            formula: trimmed.to_string(),
            detail,
        };

        let (rest, word) = keyword(&normalized)
            .map_err(|_| syntax("expected a keyword such as `today` or `sow`".into()))?;
        let anchor = lookup_anchor(word).ok_or_else(|| FormulaError::UnknownKeyword {
            keyword: word.to_string(),
            supported: supported_keywords(),
        })?;

        if rest.trim().is_empty() {
            return Ok(DateFormula {
                anchor,
                offset: 0,
                unit: OffsetUnit::Days,
            });
        }
        let (_, (offset, unit)) = all_consuming(offset)(rest).map_err(|_| {
            syntax(format!(
                "expected `+N` or `-N` with an optional d/w/m/y unit, found `{}`",
                rest.trim()
            ))
        })?;
        Ok(DateFormula {
            anchor,
            offset,
            unit,
        })
    }

    /* ------------------------------ Resolution ------------------------------ */

    /// Resolves formulas against a base date. Weeks start on `week_start` (Sunday by default).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DateFormulaParser {
        week_start: Weekday,
    }

    impl Default for DateFormulaParser {
        fn default() -> Self {
            Self::new(Weekday::Sun)
        }
    }

    impl DateFormulaParser {
        pub fn new(week_start: Weekday) -> Self {
            Self { week_start }
        }

        pub fn week_start(&self) -> Weekday {
            self.week_start
        }

        pub fn parse(&self, formula: &str, base: NaiveDate) -> Result<NaiveDate, FormulaError> {
            let parsed = parse_formula(formula)?;
            self.resolve(&parsed, base)
                .ok_or_else(|| FormulaError::OutOfRange(formula.trim().to_string()))
        }

        pub fn resolve(&self, formula: &DateFormula, base: NaiveDate) -> Option<NaiveDate> {
            let anchor = self.anchor_date(formula.anchor, base)?;
            apply_offset(anchor, formula.offset, formula.unit)
        }

        fn anchor_date(&self, anchor: Anchor, base: NaiveDate) -> Option<NaiveDate> {
            match anchor {
                Anchor::Today => Some(base),
                Anchor::Tomorrow => base.succ_opt(),
                Anchor::Yesterday => base.pred_opt(),
                Anchor::WeekStart => Some(self.start_of_week(base)),
                Anchor::WeekEnd => self.end_of_week(base),
                Anchor::MonthStart => start_of_month(base),
                Anchor::MonthEnd => end_of_month(base),
                Anchor::YearStart => NaiveDate::from_ymd_opt(base.year(), 1, 1),
                Anchor::YearEnd => NaiveDate::from_ymd_opt(base.year(), 12, 31),
            }
        }

        pub fn start_of_week(&self, day: NaiveDate) -> NaiveDate {
            let back = (7 + day.weekday().num_days_from_monday()
                - self.week_start.num_days_from_monday())
                % 7;
            day - Days::new(u64::from(back))
        }

        pub fn end_of_week(&self, day: NaiveDate) -> Option<NaiveDate> {
            self.start_of_week(day).checked_add_days(Days::new(6))
        }
    }

    pub fn start_of_month(day: NaiveDate) -> Option<NaiveDate> {
        day.with_day(1)
    }

    pub fn end_of_month(day: NaiveDate) -> Option<NaiveDate> {
        start_of_month(day)?
            .checked_add_months(Months::new(1))?
            .pred_opt()
    }

    /// Month and year offsets clamp to the last valid day (Jan 31 + 1m = Feb 28).
    fn apply_offset(day: NaiveDate, offset: i64, unit: OffsetUnit) -> Option<NaiveDate> {
        let shift_days = |n: i64| {
            if n >= 0 {
                day.checked_add_days(Days::new(n.unsigned_abs()))
            } else {
                day.checked_sub_days(Days::new(n.unsigned_abs()))
            }
        };
        let shift_months = |n: i64| {
            let months = Months::new(u32::try_from(n.unsigned_abs()).ok()?);
            if n >= 0 {
                day.checked_add_months(months)
            } else {
                day.checked_sub_months(months)
            }
        };
        match unit {
            OffsetUnit::Days => shift_days(offset),
            OffsetUnit::Weeks => shift_days(offset.checked_mul(7)?),
            OffsetUnit::Months => shift_months(offset),
            OffsetUnit::Years => shift_months(offset.checked_mul(12)?),
        }
    }

    /// Resolve with the default (Sunday-start) parser.
    pub fn parse_date_formula(formula: &str, base: NaiveDate) -> Result<NaiveDate, FormulaError> {
        DateFormulaParser::default().parse(formula, base)
    }

    /// Resolve and render as `YYYY-MM-DD`, for previews in filter editors.
    pub fn test_date_formula(formula: &str, base: NaiveDate) -> Result<String, FormulaError> {
        parse_date_formula(formula, base).map(crate::model::date_key)
    }

}

pub mod filter {
    //! Agenda filter evaluation: typed operators over record fields, nested AND/OR
    //! groups, and list dispatch across advanced, visual and legacy flat modes.
    //!
    //! Relative operands (`today+1w`, `eom`) resolve against the caller's base date,
    //! which is the day the user is looking at rather than the wall clock.

    use crate::formula::{DateFormulaParser, is_date_formula};
    use crate::logging::{CalendarLogger, default_logger};
    use crate::model::{DataRecord, Value, date_key, strip_wiki_link};
    use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
    use regex::RegexBuilder;
    use serde::{Deserialize, Serialize};
    use serde_with::skip_serializing_none;
    use std::{cmp::Ordering, sync::Arc};
    use uuid::Uuid;

    /* --------------------------- Filter definitions --------------------------- */

    /// Operand as persisted in settings.
    #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
    #[serde(untagged)]
    pub enum FilterValue {
        #[default]
        Null,
        Bool(bool),
        Number(f64),
        Text(String),
        List(Vec<String>),
    }

    impl From<&str> for FilterValue {
        fn from(s: &str) -> Self {
            FilterValue::Text(s.to_string())
        }
    }

    impl From<f64> for FilterValue {
        fn from(n: f64) -> Self {
            FilterValue::Number(n)
        }
    }

    impl From<bool> for FilterValue {
        fn from(b: bool) -> Self {
            FilterValue::Bool(b)
        }
    }

    impl From<Vec<&str>> for FilterValue {
        fn from(xs: Vec<&str>) -> Self {
            FilterValue::List(xs.into_iter().map(str::to_string).collect())
        }
    }

    impl From<&FilterValue> for Value {
        fn from(value: &FilterValue) -> Self {
            match value {
                FilterValue::Null => Value::Null,
                FilterValue::Bool(b) => Value::Bool(*b),
                FilterValue::Number(n) => Value::Number(*n),
                FilterValue::Text(s) => Value::Text(s.clone()),
                FilterValue::List(xs) => Value::List(xs.clone()),
            }
        }
    }

    fn enabled_by_default() -> bool {
        true
    }

    /// A single condition. `operator` stays a string so unknown and legacy names survive
    /// a settings round trip.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct AgendaFilter {
        pub id: String,
        pub field: String,
        pub operator: String,
        #[serde(default)]
        pub value: FilterValue,
        #[serde(default = "enabled_by_default")]
        pub enabled: bool,
    }

    impl AgendaFilter {
        pub fn new(
            field: impl Into<String>,
            operator: impl Into<String>,
            value: impl Into<FilterValue>,
        ) -> Self {
            Self {
                id: Uuid::new_v4().to_string(),
                field: field.into(),
                operator: operator.into(),
                value: value.into(),
                enabled: true,
            }
        }

        pub fn disabled(mut self) -> Self {
            self.enabled = false;
            self
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub enum Conjunction {
        #[default]
        #[serde(rename = "AND", alias = "and")]
        And,
        #[serde(rename = "OR", alias = "or")]
        Or,
    }

    /// Recursive AND/OR tree. Acyclic by construction of the settings schema.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct AgendaFilterGroup {
        pub id: String,
        #[serde(default)]
        pub conjunction: Conjunction,
        #[serde(default)]
        pub filters: Vec<AgendaFilter>,
        #[serde(default)]
        pub groups: Vec<AgendaFilterGroup>,
    }

    impl AgendaFilterGroup {
        pub fn new(conjunction: Conjunction) -> Self {
            Self {
                id: Uuid::new_v4().to_string(),
                conjunction,
                filters: vec![],
                groups: vec![],
            }
        }

        pub fn with_filter(mut self, filter: AgendaFilter) -> Self {
            self.filters.push(filter);
            self
        }

        pub fn with_group(mut self, group: AgendaFilterGroup) -> Self {
            self.groups.push(group);
            self
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum FilterMode {
        Advanced,
        Visual,
    }

    /// A saved agenda list. Without a `filterMode` the list predates visual groups and
    /// its flat `filters` are AND-ed.
    #[skip_serializing_none]
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct AgendaCustomList {
        pub id: String,
        #[serde(default)]
        pub name: String,
        pub filter_mode: Option<FilterMode>,
        pub formula: Option<String>,
        pub filter_group: Option<AgendaFilterGroup>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub filters: Vec<AgendaFilter>,
    }

    impl AgendaCustomList {
        pub fn visual(name: impl Into<String>, group: AgendaFilterGroup) -> Self {
            Self {
                id: Uuid::new_v4().to_string(),
                name: name.into(),
                filter_mode: Some(FilterMode::Visual),
                formula: None,
                filter_group: Some(group),
                filters: vec![],
            }
        }

        pub fn advanced(name: impl Into<String>, formula: impl Into<String>) -> Self {
            Self {
                id: Uuid::new_v4().to_string(),
                name: name.into(),
                filter_mode: Some(FilterMode::Advanced),
                formula: Some(formula.into()),
                filter_group: None,
                filters: vec![],
            }
        }

        pub fn legacy(name: impl Into<String>, filters: Vec<AgendaFilter>) -> Self {
            Self {
                id: Uuid::new_v4().to_string(),
                name: name.into(),
                filter_mode: None,
                formula: None,
                filter_group: None,
                filters,
            }
        }
    }

    /* ------------------------------ Operators ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum FilterOperator {
        IsEmpty,
        IsNotEmpty,
        Is,
        IsNot,
        Contains,
        NotContains,
        StartsWith,
        EndsWith,
        Regex,
        Eq,
        Neq,
        Lt,
        Gt,
        Lte,
        Gte,
        IsChecked,
        IsNotChecked,
        IsOn,
        IsNotOn,
        IsBefore,
        IsAfter,
        IsOnAndBefore,
        IsOnAndAfter,
        IsToday,
        IsOverdue,
        IsUpcoming,
        IsThisWeek,
        IsThisMonth,
        HasAnyOf,
        HasAllOf,
        HasNoneOf,
        HasKeyword,
    }

    const OPERATOR_NAMES: &[(&str, FilterOperator)] = &[
        ("is-empty", FilterOperator::IsEmpty),
        ("is-not-empty", FilterOperator::IsNotEmpty),
        ("is", FilterOperator::Is),
        ("is-not", FilterOperator::IsNot),
        ("contains", FilterOperator::Contains),
        ("not-contains", FilterOperator::NotContains),
        ("starts-with", FilterOperator::StartsWith),
        ("ends-with", FilterOperator::EndsWith),
        ("regex", FilterOperator::Regex),
        ("eq", FilterOperator::Eq),
        ("neq", FilterOperator::Neq),
        ("lt", FilterOperator::Lt),
        ("gt", FilterOperator::Gt),
        ("lte", FilterOperator::Lte),
        ("gte", FilterOperator::Gte),
        ("is-checked", FilterOperator::IsChecked),
        ("is-not-checked", FilterOperator::IsNotChecked),
        ("is-on", FilterOperator::IsOn),
        ("is-not-on", FilterOperator::IsNotOn),
        ("is-before", FilterOperator::IsBefore),
        ("is-after", FilterOperator::IsAfter),
        ("is-on-and-before", FilterOperator::IsOnAndBefore),
        ("is-on-and-after", FilterOperator::IsOnAndAfter),
        ("is-today", FilterOperator::IsToday),
        ("is-overdue", FilterOperator::IsOverdue),
        ("is-upcoming", FilterOperator::IsUpcoming),
        ("is-this-week", FilterOperator::IsThisWeek),
        ("is-this-month", FilterOperator::IsThisMonth),
        ("has-any-of", FilterOperator::HasAnyOf),
        ("has-all-of", FilterOperator::HasAllOf),
        ("has-none-of", FilterOperator::HasNoneOf),
        ("has-keyword", FilterOperator::HasKeyword),
    ];

    /// Snake_case names from older settings, mapped once before dispatch.
    const LEGACY_OPERATORS: &[(&str, &str)] = &[
        ("equals", "is"),
        ("not_equals", "is-not"),
        ("not_contains", "not-contains"),
        ("starts_with", "starts-with"),
        ("ends_with", "ends-with"),
        ("is_empty", "is-empty"),
        ("is_not_empty", "is-not-empty"),
        ("greater_than", "gt"),
        ("less_than", "lt"),
        ("matches_regex", "regex"),
    ];

    pub fn canonical_operator_name(name: &str) -> &str {
        LEGACY_OPERATORS
            .iter()
            .find(|(legacy, _)| *legacy == name)
            .map(|(_, canonical)| *canonical)
            .unwrap_or(name)
    }

    impl FilterOperator {
        /// Accepts canonical and legacy names.
        pub fn parse(name: &str) -> Option<Self> {
            let canonical = canonical_operator_name(name.trim());
            OPERATOR_NAMES
                .iter()
                .find(|(n, _)| *n == canonical)
                .map(|(_, op)| *op)
        }

        pub fn as_str(self) -> &'static str {
            OPERATOR_NAMES
                .iter()
                .find(|(_, op)| *op == self)
                .map(|(n, _)| *n)
                .unwrap_or("unknown")
        }
    }

    /* ---------------------------- Formula seam ---------------------------- */

    /// Parser for the free-form list formulas of advanced mode, supplied by the host.
    pub trait FormulaEvaluator {
        fn parse_formula(&self, source: &str) -> anyhow::Result<Box<dyn CompiledFormula>>;
    }

    pub trait CompiledFormula {
        fn evaluate(&self, record: &DataRecord, base: NaiveDateTime) -> anyhow::Result<bool>;
    }

    /* ------------------------------- Engine ------------------------------- */

    pub struct FilterEngine {
        logger: Arc<dyn CalendarLogger>,
        formulas: DateFormulaParser,
        evaluator: Option<Box<dyn FormulaEvaluator>>,
    }

    impl Default for FilterEngine {
        fn default() -> Self {
            Self::new(default_logger())
        }
    }

    impl FilterEngine {
        pub fn new(logger: Arc<dyn CalendarLogger>) -> Self {
            Self {
                logger,
                formulas: DateFormulaParser::default(),
                evaluator: None,
            }
        }

        pub fn with_week_start(mut self, week_start: Weekday) -> Self {
            self.formulas = DateFormulaParser::new(week_start);
            self
        }

        pub fn with_formula_evaluator(mut self, evaluator: Box<dyn FormulaEvaluator>) -> Self {
            self.evaluator = Some(evaluator);
            self
        }

        /// Evaluate one condition. Unknown operators log a warning and exclude the record.
        pub fn evaluate_filter(
            &self,
            record: &DataRecord,
            filter: &AgendaFilter,
            base: NaiveDate,
        ) -> bool {
            let Some(operator) = FilterOperator::parse(&filter.operator) else {
                self.logger.warn(&format!(
                    "unknown filter operator `{}` on field `{}`",
                    filter.operator, filter.field
                ));
                return false;
            };
            let field = prepare_field(record.get(&filter.field));
            let operand = self.resolve_operand(&filter.value, base);
            self.apply(operator, &field, &operand, base)
        }

        /// Disabled filters are skipped; a group with nothing left to evaluate matches.
        pub fn evaluate_filter_group(
            &self,
            record: &DataRecord,
            group: &AgendaFilterGroup,
            base: NaiveDate,
        ) -> bool {
            let mut outcomes = group
                .filters
                .iter()
                .filter(|f| f.enabled)
                .map(|f| self.evaluate_filter(record, f, base))
                .chain(
                    group
                        .groups
                        .iter()
                        .map(|g| self.evaluate_filter_group(record, g, base)),
                )
                .peekable();
            if outcomes.peek().is_none() {
                return true;
            }
            match group.conjunction {
                Conjunction::And => outcomes.all(|ok| ok),
                Conjunction::Or => outcomes.any(|ok| ok),
            }
        }

        pub fn filter_records_for_list(
            &self,
            records: &[Arc<DataRecord>],
            list: &AgendaCustomList,
            base: NaiveDate,
        ) -> Vec<Arc<DataRecord>> {
            match (list.filter_mode, &list.filter_group) {
                (Some(FilterMode::Advanced), _) => {
                    self.filter_by_formula(records, list.formula.as_deref().unwrap_or(""), base)
                }
                (Some(FilterMode::Visual), Some(group)) | (None, Some(group)) => records
                    .iter()
                    .filter(|r| self.evaluate_filter_group(r, group, base))
                    .cloned()
                    .collect(),
                (Some(FilterMode::Visual), None) => records.to_vec(),
                (None, None) => records
                    .iter()
                    .filter(|r| {
                        list.filters
                            .iter()
                            .filter(|f| f.enabled)
                            .all(|f| self.evaluate_filter(r, f, base))
                    })
                    .cloned()
                    .collect(),
            }
        }

        fn filter_by_formula(
            &self,
            records: &[Arc<DataRecord>],
            source: &str,
            base: NaiveDate,
        ) -> Vec<Arc<DataRecord>> {
            if source.trim().is_empty() {
                return records.to_vec();
            }
            let Some(evaluator) = &self.evaluator else {
                self.logger
                    .error("advanced list formula present but no formula evaluator is installed");
                return vec![];
            };
            let compiled = match evaluator.parse_formula(source) {
                Ok(compiled) => compiled,
                Err(err) => {
                    self.logger
                        .error(&format!("failed to parse list formula `{source}`: {err:#}"));
                    return vec![];
                }
            };
            let base_at = base.and_time(NaiveTime::MIN);
            records
                .iter()
                .filter(|record| match compiled.evaluate(record, base_at) {
                    Ok(matched) => matched,
                    Err(err) => {
                        self.logger.warn(&format!(
                            "list formula failed on record `{}`: {err:#}",
                            record.id
                        ));
                        false
                    }
                })
                .cloned()
                .collect()
        }

        /// Formula-looking strings resolve to `YYYY-MM-DD`; a failed resolution keeps the
        /// raw text so the comparison degrades to a literal match.
        fn resolve_operand(&self, value: &FilterValue, base: NaiveDate) -> Value {
            match value {
                FilterValue::Text(raw) if is_date_formula(raw) => {
                    match self.formulas.parse(raw, base) {
                        Ok(day) => Value::Text(date_key(day)),
                        Err(err) => {
                            self.logger
                                .debug(&format!("filter value `{raw}` kept literally: {err}"));
                            Value::Text(raw.clone())
                        }
                    }
                }
                other => Value::from(other),
            }
        }

        fn apply(
            &self,
            operator: FilterOperator,
            field: &Value,
            operand: &Value,
            base: NaiveDate,
        ) -> bool {
            use FilterOperator as Op;
            match operator {
                Op::IsEmpty => field.is_empty(),
                Op::IsNotEmpty => !field.is_empty(),
                Op::Is => is_equal(field, operand),
                Op::IsNot => !is_equal(field, operand),
                Op::Contains => any_text(field, operand, |f, o| f.contains(o)),
                Op::NotContains => !any_text(field, operand, |f, o| f.contains(o)),
                Op::StartsWith => any_text(field, operand, |f, o| f.starts_with(o)),
                Op::EndsWith => any_text(field, operand, |f, o| f.ends_with(o)),
                Op::Regex => self.matches_regex(field, operand),
                Op::Eq => compare_numbers(field, operand, |a, b| a == b),
                Op::Neq => compare_numbers(field, operand, |a, b| a != b),
                Op::Lt => compare_ordered(field, operand, Ordering::is_lt),
                Op::Gt => compare_ordered(field, operand, Ordering::is_gt),
                Op::Lte => compare_ordered(field, operand, Ordering::is_le),
                Op::Gte => compare_ordered(field, operand, Ordering::is_ge),
                Op::IsChecked => matches!(field, Value::Bool(true)),
                Op::IsNotChecked => !matches!(field, Value::Bool(true)),
                Op::IsOn => compare_days(field, operand, |f, o| f == o),
                Op::IsNotOn => compare_days(field, operand, |f, o| f != o),
                Op::IsBefore => compare_days(field, operand, |f, o| f < o),
                Op::IsAfter => compare_days(field, operand, |f, o| f > o),
                Op::IsOnAndBefore => compare_days(field, operand, |f, o| f <= o),
                Op::IsOnAndAfter => compare_days(field, operand, |f, o| f >= o),
                Op::IsToday => as_day(field).is_some_and(|d| d == base),
                Op::IsOverdue => as_day(field).is_some_and(|d| d < base),
                Op::IsUpcoming => as_day(field).is_some_and(|d| d > base),
                Op::IsThisWeek => as_day(field).is_some_and(|d| {
                    let start = self.formulas.start_of_week(base);
                    let end = self.formulas.end_of_week(base);
                    d >= start && end.is_none_or(|end| d <= end)
                }),
                Op::IsThisMonth => as_day(field)
                    .is_some_and(|d| d.year() == base.year() && d.month() == base.month()),
                Op::HasAnyOf => {
                    let wanted = operand_list(operand);
                    let have = lowered(field.as_list());
                    wanted.iter().any(|w| have.contains(w))
                }
                Op::HasAllOf => {
                    let wanted = operand_list(operand);
                    let have = lowered(field.as_list());
                    wanted.iter().all(|w| have.contains(w))
                }
                Op::HasNoneOf => {
                    let wanted = operand_list(operand);
                    let have = lowered(field.as_list());
                    !wanted.iter().any(|w| have.contains(w))
                }
                Op::HasKeyword => {
                    let keyword = operand.to_text().unwrap_or_default().trim().to_lowercase();
                    !keyword.is_empty()
                        && lowered(field.as_list()).iter().any(|x| x.contains(&keyword))
                }
            }
        }

        fn matches_regex(&self, field: &Value, operand: &Value) -> bool {
            let Some(pattern) = operand.to_text() else {
                return false;
            };
            match RegexBuilder::new(&pattern).case_insensitive(true).build() {
                Ok(re) => text_candidates(field).iter().any(|s| re.is_match(s)),
                Err(err) => {
                    self.logger
                        .warn(&format!("invalid filter regex `{pattern}`: {err}"));
                    false
                }
            }
        }
    }

    /* ------------------------------ Helpers ------------------------------ */

    fn prepare_field(value: Option<&Value>) -> Value {
        match value {
            None => Value::Null,
            Some(Value::Text(s)) => Value::Text(strip_wiki_link(s)),
            Some(Value::List(xs)) => Value::List(xs.iter().map(|s| strip_wiki_link(s)).collect()),
            Some(other) => other.clone(),
        }
    }

    /// Only text and typed dates are read as days; numbers stay numbers.
    fn as_day(value: &Value) -> Option<NaiveDate> {
        match value {
            Value::Text(_) | Value::Date(_) => value.to_date_like(None).map(|d| d.day()),
            _ => None,
        }
    }

    fn text_candidates(field: &Value) -> Vec<String> {
        match field {
            Value::List(xs) => xs.clone(),
            other => other.to_text().into_iter().collect(),
        }
    }

    fn lowered(xs: Vec<String>) -> Vec<String> {
        xs.into_iter().map(|s| s.trim().to_lowercase()).collect()
    }

    fn operand_list(operand: &Value) -> Vec<String> {
        let raw = match operand {
            Value::Text(s) => s.split(',').map(str::to_string).collect(),
            other => other.as_list(),
        };
        lowered(raw).into_iter().filter(|s| !s.is_empty()).collect()
    }

    /// Day equality when both sides read as dates, exact text equality otherwise.
    fn is_equal(field: &Value, operand: &Value) -> bool {
        if let (Some(a), Some(b)) = (as_day(field), as_day(operand)) {
            return a == b;
        }
        let Some(expected) = operand.to_text() else {
            return field.is_empty();
        };
        match field {
            Value::Null => false,
            Value::List(xs) => xs.iter().any(|x| *x == expected),
            other => other.to_text().is_some_and(|t| t == expected),
        }
    }

    /// Case-insensitive text predicate; list fields match when any element does.
    fn any_text(field: &Value, operand: &Value, pred: impl Fn(&str, &str) -> bool) -> bool {
        let Some(needle) = operand.to_text() else {
            return false;
        };
        let needle = needle.to_lowercase();
        text_candidates(field)
            .iter()
            .any(|hay| pred(&hay.to_lowercase(), &needle))
    }

    fn compare_numbers(field: &Value, operand: &Value, pred: impl Fn(f64, f64) -> bool) -> bool {
        match (field.to_number(), operand.to_number()) {
            (Some(a), Some(b)) => pred(a, b),
            _ => false,
        }
    }

    /// Numeric ordering, falling back to day ordering when both sides are date-like.
    fn compare_ordered(field: &Value, operand: &Value, pred: impl Fn(Ordering) -> bool) -> bool {
        if let (Some(a), Some(b)) = (field.to_number(), operand.to_number()) {
            return a.partial_cmp(&b).is_some_and(pred);
        }
        match (as_day(field), as_day(operand)) {
            (Some(a), Some(b)) => pred(a.cmp(&b)),
            _ => false,
        }
    }

    fn compare_days(
        field: &Value,
        operand: &Value,
        pred: impl Fn(NaiveDate, NaiveDate) -> bool,
    ) -> bool {
        match (as_day(field), as_day(operand)) {
            (Some(a), Some(b)) => pred(a, b),
            _ => false,
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::logging::{LogLevel, RecordingLogger};

        fn d(y: i32, m: u32, day: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, day).unwrap()
        }

        fn base() -> NaiveDate {
            d(2026, 2, 7)
        }

        fn check(
            record: &DataRecord,
            field: &str,
            op: &str,
            value: impl Into<FilterValue>,
        ) -> bool {
            FilterEngine::default().evaluate_filter(
                record,
                &AgendaFilter::new(field, op, value),
                base(),
            )
        }

        #[test]
        fn is_on_resolves_today_against_base_date() {
            let on = DataRecord::new("a").with_value("due", "2026-02-07");
            let after = DataRecord::new("b").with_value("due", "2026-02-08");
            assert!(check(&on, "due", "is-on", "today"));
            assert!(!check(&after, "due", "is-on", "today"));
            assert!(check(&after, "due", "is-on", "tomorrow"));
        }

        #[test]
        fn empty_group_matches_everything() {
            let record = DataRecord::new("a");
            let engine = FilterEngine::default();
            for conjunction in [Conjunction::And, Conjunction::Or] {
                let empty = AgendaFilterGroup::new(conjunction);
                assert!(engine.evaluate_filter_group(&record, &empty, base()));
            }

            let only_disabled = AgendaFilterGroup::new(Conjunction::Or)
                .with_filter(AgendaFilter::new("x", "is-checked", FilterValue::Null).disabled());
            assert!(engine.evaluate_filter_group(&record, &only_disabled, base()));
        }

        #[test]
        fn nested_groups_combine_with_conjunctions() {
            let record = DataRecord::new("a")
                .with_value("status", "open")
                .with_value("priority", 3.0);
            let engine = FilterEngine::default();
            let either = AgendaFilterGroup::new(Conjunction::Or)
                .with_filter(AgendaFilter::new("priority", "gt", 5.0))
                .with_filter(AgendaFilter::new("status", "is", "open"));
            let group = AgendaFilterGroup::new(Conjunction::And)
                .with_filter(AgendaFilter::new("priority", "gte", 3.0))
                .with_group(either);
            assert!(engine.evaluate_filter_group(&record, &group, base()));

            let strict = group.with_filter(AgendaFilter::new("status", "is-not", "open"));
            assert!(!engine.evaluate_filter_group(&record, &strict, base()));
        }

        #[test]
        fn string_operators_are_case_insensitive_and_list_aware() {
            let record = DataRecord::new("a")
                .with_value("title", "Quarterly Review")
                .with_value("tags", vec!["Work", "planning"]);
            assert!(check(&record, "title", "contains", "review"));
            assert!(check(&record, "title", "starts-with", "quarter"));
            assert!(check(&record, "title", "ends-with", "VIEW"));
            assert!(check(&record, "tags", "contains", "plan"));
            assert!(check(&record, "title", "not-contains", "budget"));
            assert!(!check(&record, "missing", "contains", "x"));
            assert!(check(&record, "title", "regex", "^quarterly\\s+\\w+$"));
        }

        #[test]
        fn invalid_regex_fails_closed_and_logs() {
            let logger = Arc::new(RecordingLogger::new());
            let engine = FilterEngine::new(logger.clone());
            let record = DataRecord::new("a").with_value("title", "x(");
            let filter = AgendaFilter::new("title", "regex", "x(");
            assert!(!engine.evaluate_filter(&record, &filter, base()));
            assert_eq!(logger.messages_at(LogLevel::Warn).len(), 1);
        }

        #[test]
        fn unknown_operator_fails_closed_and_logs() {
            let logger = Arc::new(RecordingLogger::new());
            let engine = FilterEngine::new(logger.clone());
            let record = DataRecord::new("a").with_value("title", "x");
            let filter = AgendaFilter::new("title", "resembles", "x");
            assert!(!engine.evaluate_filter(&record, &filter, base()));
            assert!(logger.messages_at(LogLevel::Warn)[0].contains("resembles"));
        }

        #[test]
        fn is_compares_dates_by_day() {
            let record = DataRecord::new("a").with_value("when", "2026-02-07T15:00");
            assert!(check(&record, "when", "is", "2026-02-07"));
            assert!(check(&record, "when", "is", "today"));
            assert!(!check(&record, "when", "is-not", "2026-02-07"));
            let plain = DataRecord::new("b").with_value("status", "[[Status/Done|done]]");
            assert!(check(&plain, "status", "is", "done"));
            assert!(!check(&plain, "status", "is", "Done"));
        }

        #[test]
        fn numbers_coerce_permissively_and_fail_closed() {
            let record = DataRecord::new("a")
                .with_value("points", "8")
                .with_value("blank", "   ")
                .with_value("due", "2026-02-10");
            assert!(check(&record, "points", "eq", 8.0));
            assert!(check(&record, "points", "gt", "5"));
            assert!(check(&record, "points", "lte", 8.0));
            assert!(!check(&record, "points", "neq", 8.0));
            assert!(!check(&record, "blank", "eq", 0.0));
            assert!(!check(&record, "blank", "neq", 0.0));
            assert!(check(&record, "due", "gt", "2026-02-07"));
            assert!(check(&record, "due", "lt", "eom"));
        }

        #[test]
        fn checkbox_is_strictly_true() {
            let record = DataRecord::new("a")
                .with_value("done", true)
                .with_value("text", "true");
            assert!(check(&record, "done", "is-checked", FilterValue::Null));
            assert!(!check(&record, "text", "is-checked", FilterValue::Null));
            assert!(check(&record, "text", "is-not-checked", FilterValue::Null));
        }

        #[test]
        fn relative_date_operators_use_base_not_wall_clock() {
            let today = DataRecord::new("a").with_value("due", "2026-02-07");
            let past = DataRecord::new("b").with_value("due", "2026-02-01");
            let future = DataRecord::new("c").with_value("due", "2026-03-02");
            assert!(check(&today, "due", "is-today", FilterValue::Null));
            assert!(check(&past, "due", "is-overdue", FilterValue::Null));
            assert!(check(&future, "due", "is-upcoming", FilterValue::Null));
            assert!(check(&past, "due", "is-this-week", FilterValue::Null));
            assert!(check(&past, "due", "is-this-month", FilterValue::Null));
            assert!(!check(&future, "due", "is-this-month", FilterValue::Null));
            assert!(!check(&DataRecord::new("d"), "due", "is-overdue", FilterValue::Null));
        }

        #[test]
        fn day_comparisons_resolve_operands_against_base() {
            let record = DataRecord::new("a").with_value("due", "2026-02-07T18:00");
            assert!(check(&record, "due", "is-not-on", "tomorrow"));
            assert!(!check(&record, "due", "is-not-on", "today"));
            assert!(check(&record, "due", "is-before", "tomorrow"));
            assert!(!check(&record, "due", "is-before", "today"));
            assert!(check(&record, "due", "is-after", "yesterday"));
            assert!(!check(&record, "due", "is-after", "today"));
            assert!(check(&record, "due", "is-on-and-after", "today"));
            assert!(check(&record, "due", "is-on-and-after", "2026-02-01"));
            assert!(!check(&record, "due", "is-on-and-after", "tomorrow"));

            let undated = DataRecord::new("b");
            for op in ["is-not-on", "is-before", "is-after", "is-on-and-after"] {
                assert!(!check(&undated, "due", op, "today"), "{op}");
            }
        }

        #[test]
        fn list_operators_intersect_case_insensitively() {
            let record = DataRecord::new("a").with_value("tags", vec!["work", "Urgent"]);
            assert!(check(&record, "tags", "has-any-of", vec!["home", "urgent"]));
            assert!(check(&record, "tags", "has-all-of", "work, urgent"));
            assert!(!check(&record, "tags", "has-all-of", vec!["work", "home"]));
            assert!(check(&record, "tags", "has-none-of", vec!["home"]));
            assert!(check(&record, "tags", "has-keyword", "urg"));
            assert!(!check(&record, "tags", "has-keyword", ""));
        }

        #[test]
        fn emptiness_covers_null_blank_and_empty_list() {
            let record = DataRecord::new("a")
                .with_value("blank", "")
                .with_value("none", Value::Null)
                .with_value("list", Value::List(vec![]))
                .with_value("set", "x");
            for field in ["blank", "none", "list", "missing"] {
                assert!(check(&record, field, "is-empty", FilterValue::Null), "{field}");
            }
            assert!(check(&record, "set", "is-not-empty", FilterValue::Null));
        }

        #[test]
        fn legacy_operator_names_behave_like_canonical() {
            let record = DataRecord::new("a")
                .with_value("status", "open")
                .with_value("points", 4.0);
            let cases = [
                ("equals", "is", FilterValue::from("open"), true),
                ("not_equals", "is-not", FilterValue::from("open"), false),
                ("greater_than", "gt", FilterValue::from(3.0), true),
                ("less_than", "lt", FilterValue::from(3.0), false),
                ("is_empty", "is-empty", FilterValue::Null, false),
                ("is_not_empty", "is-not-empty", FilterValue::Null, true),
                ("starts_with", "starts-with", FilterValue::from("op"), true),
                ("ends_with", "ends-with", FilterValue::from("EN"), true),
                ("not_contains", "not-contains", FilterValue::from("clo"), true),
                ("matches_regex", "regex", FilterValue::from("^o.en$"), true),
            ];
            for (legacy, canonical, value, expected) in cases {
                let field = match value {
                    FilterValue::Number(_) => "points",
                    _ => "status",
                };
                let canonical_result = check(&record, field, canonical, value.clone());
                assert_eq!(canonical_result, expected, "{canonical}");
                assert_eq!(check(&record, field, legacy, value), expected, "{legacy}");
            }
            assert!(!check(&record, "status", "not_contains", "PEN"));
            assert_eq!(FilterOperator::parse("matches_regex"), Some(FilterOperator::Regex));
            assert_eq!(FilterOperator::Gte.as_str(), "gte");
        }

        #[test]
        fn mistyped_formula_degrades_to_literal_comparison() {
            let record = DataRecord::new("a").with_value("label", "today+");
            assert!(check(&record, "label", "is", "today+"));
        }

        #[test]
        fn filter_definitions_deserialize_from_settings_json() {
            let list: AgendaCustomList = serde_json::from_str(
                r#"{
                    "id": "l1",
                    "name": "Due soon",
                    "filterMode": "visual",
                    "filterGroup": {
                        "id": "g1",
                        "conjunction": "OR",
                        "filters": [
                            {"id": "f1", "field": "due", "operator": "is-today", "value": null},
                            {"id": "f2", "field": "due", "operator": "is-overdue", "enabled": false}
                        ]
                    }
                }"#,
            )
            .expect("list json");
            let group = list.filter_group.expect("group");
            assert_eq!(group.conjunction, Conjunction::Or);
            assert!(group.filters[0].enabled);
            assert!(!group.filters[1].enabled);
            assert!(group.groups.is_empty());
        }
    }
}

pub mod processor {
    //! Turns loosely typed records into calendar events.
    //!
    //! Phase one builds immutable drafts (dates, times, render type, span, color); phase
    //! two assigns header lanes as a separate `id → lane` map merged into the output.

    use crate::logging::{CalendarLogger, default_logger};
    use crate::model::{
        CalendarConfig, DataFrame, DataRecord, DateLike, ProcessedCalendarData, ProcessedRecord,
        RenderType, SpanInfo, TimeInfo, Value, date_key, non_empty, parse_time_of_day,
    };
    use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
    use indexmap::IndexMap;
    use serde::Serialize;
    use std::{collections::BTreeMap, sync::Arc};

    const START_DATE_CANDIDATES: &[&str] =
        &["startDate", "date", "deadline", "dueDate", "scheduled"];
    const END_DATE_CANDIDATES: &[&str] = &["endDate", "end", "due"];
    const FALLBACK_COLOR_FIELD: &str = "color";

    /// Upper bound on the days a single event is replicated into when grouping.
    pub const MAX_SPAN_DAYS: i64 = 365;

    pub type ColorResolver = Box<dyn Fn(&DataRecord) -> Option<String>>;

    /// Raw start/end as found on the record, before one is filled from the other.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ExtractedDates {
        pub start: Option<DateLike>,
        pub end: Option<DateLike>,
    }

    pub struct CalendarDataProcessor {
        config: CalendarConfig,
        logger: Arc<dyn CalendarLogger>,
        color_resolver: Option<ColorResolver>,
    }

    impl CalendarDataProcessor {
        pub fn new(config: CalendarConfig, logger: Arc<dyn CalendarLogger>) -> Self {
            Self {
                config,
                logger,
                color_resolver: None,
            }
        }

        pub fn with_config(config: CalendarConfig) -> Self {
            Self::new(config, default_logger())
        }

        /// Last-resort color source, consulted after the configured and `color` fields.
        pub fn with_color_resolver(
            mut self,
            resolver: impl Fn(&DataRecord) -> Option<String> + 'static,
        ) -> Self {
            self.color_resolver = Some(Box::new(resolver));
            self
        }

        pub fn config(&self) -> &CalendarConfig {
            &self.config
        }

        pub fn process(&self, frame: &DataFrame) -> ProcessedCalendarData {
            let drafts: Vec<ProcessedRecord> = frame
                .records
                .iter()
                .filter_map(|record| self.process_record(record))
                .collect();
            let lanes = assign_lanes(&drafts);

            let processed: Vec<ProcessedRecord> = drafts
                .into_iter()
                .zip(lanes)
                .map(|(mut draft, lane)| {
                    draft.lane = lane;
                    draft
                })
                .collect();
            let max_lane = processed
                .iter()
                .filter(|p| p.render_type.is_header())
                .map(|p| p.lane)
                .max()
                .unwrap_or(0);
            let grouped = self.group_by_date(&processed);
            let index = processed
                .iter()
                .map(|p| (p.id().to_string(), p.clone()))
                .collect::<IndexMap<_, _>>();

            self.logger.debug(&format!(
                "processed {} of {} records across {} days (max lane {max_lane})",
                processed.len(),
                frame.records.len(),
                grouped.len()
            ));
            ProcessedCalendarData {
                processed,
                grouped,
                index,
                max_lane,
            }
        }

        /// `None` when the record carries neither a start nor an end date.
        pub fn process_record(&self, record: &Arc<DataRecord>) -> Option<ProcessedRecord> {
            let ExtractedDates { start, end } = self.extract_dates(record);
            let start_resolved = start.or(end)?;
            let end_resolved = end.or(start)?;
            let explicit_end = if start.is_some() { end } else { None };

            let time_info = self.extract_time_info(record, start_resolved, explicit_end);
            let span_info = calculate_span(start_resolved.day(), end_resolved.day());
            let (start_date, end_date) = ordered(start_resolved.day(), end_resolved.day());

            Some(ProcessedRecord {
                record: Arc::clone(record),
                render_type: RenderType::classify(span_info.is_some(), time_info.is_some()),
                start_date,
                end_date,
                time_info,
                span_info,
                color: self.resolve_color(record),
                lane: 0,
                is_phantom: false,
            })
        }

        /// Start: configured field, else the legacy `dateField`, else the first candidate
        /// field holding a parseable date. End: configured field, else candidates.
        pub fn extract_dates(&self, record: &DataRecord) -> ExtractedDates {
            let start = match non_empty(&self.config.start_date_field)
                .or_else(|| non_empty(&self.config.date_field))
            {
                Some(field) => self.date_from_field(record, field),
                None => self.first_date(record, START_DATE_CANDIDATES),
            };
            let end = match non_empty(&self.config.end_date_field) {
                Some(field) => self.date_from_field(record, field),
                None => self.first_date(record, END_DATE_CANDIDATES),
            };
            ExtractedDates { start, end }
        }

        /// Embedded times win over the separate time fields. With no time signal at all
        /// the event is all-day (`None`).
        pub fn extract_time_info(
            &self,
            record: &DataRecord,
            start: DateLike,
            end: Option<DateLike>,
        ) -> Option<TimeInfo> {
            let start_field = self.time_from_field(record, self.config.start_time_field());
            let end_field = self.time_from_field(record, self.config.end_time_field());
            let end_embedded = end.filter(|e| e.has_time);
            let end_day = end.map(|e| e.day()).unwrap_or(start.day());

            let start_at = if start.has_time {
                Some(start.at)
            } else {
                start_field.map(|t| start.day().and_time(t))
            };
            let end_at = match end_embedded {
                Some(e) => Some(e.at),
                None => end_field.map(|t| end_day.and_time(t)),
            };

            let (start_at, end_at) = match (start_at, end_at) {
                (None, None) => return None,
                (Some(s), Some(e)) => (s, e),
                (Some(s), None) => (s, s + Duration::hours(1)),
                (None, Some(e)) => (start.day().and_time(e.time()) - Duration::hours(1), e),
            };
            let (start_at, end_at) = normalize_time_range(start_at, end_at);

            Some(TimeInfo {
                start_time: start_at,
                end_time: end_at,
                duration_minutes: (end_at - start_at).num_minutes().max(0),
                has_embedded_time: start.has_time || end_embedded.is_some(),
            })
        }

        fn date_from_field(&self, record: &DataRecord, field: &str) -> Option<DateLike> {
            record.get(field)?.to_date_like(self.config.timezone)
        }

        fn first_date(&self, record: &DataRecord, candidates: &[&str]) -> Option<DateLike> {
            candidates
                .iter()
                .find_map(|field| self.date_from_field(record, field))
        }

        fn time_from_field(&self, record: &DataRecord, field: &str) -> Option<NaiveTime> {
            match record.get(field)? {
                Value::Text(s) => parse_time_of_day(s),
                Value::Date(at) => Some(at.time()),
                _ => None,
            }
        }

        fn resolve_color(&self, record: &DataRecord) -> Option<String> {
            non_empty(&self.config.event_color_field)
                .and_then(|field| color_value(record, field))
                .or_else(|| color_value(record, FALLBACK_COLOR_FIELD))
                .or_else(|| self.color_resolver.as_ref().and_then(|resolve| resolve(record)))
        }

        fn group_by_date(
            &self,
            processed: &[ProcessedRecord],
        ) -> BTreeMap<String, Vec<ProcessedRecord>> {
            let mut grouped: BTreeMap<String, Vec<ProcessedRecord>> = BTreeMap::new();
            for record in processed {
                let span = (record.end_date - record.start_date).num_days() + 1;
                if span > MAX_SPAN_DAYS {
                    self.logger.warn(&format!(
                        "event `{}` spans {span} days; grouping truncated to {MAX_SPAN_DAYS}",
                        record.id()
                    ));
                }
                for day in record.days().take(MAX_SPAN_DAYS as usize) {
                    grouped.entry(date_key(day)).or_default().push(record.clone());
                }
            }
            grouped
        }
    }

    fn color_value(record: &DataRecord, field: &str) -> Option<String> {
        record
            .get(field)?
            .to_text()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn ordered(a: NaiveDate, b: NaiveDate) -> (NaiveDate, NaiveDate) {
        if b < a { (b, a) } else { (a, b) }
    }

    /// Overnight correction: an end earlier in the same day rolls to the next day; a
    /// zero-length range becomes one hour.
    pub fn normalize_time_range(
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> (NaiveDateTime, NaiveDateTime) {
        let mut end = end;
        if start.date() == end.date() && end.time() < start.time() {
            end += Duration::days(1);
        }
        if end == start {
            end = start + Duration::hours(1);
        }
        (start, end)
    }

    /// `None` for single-day events; reversed ranges are swapped first.
    pub fn calculate_span(start: NaiveDate, end: NaiveDate) -> Option<SpanInfo> {
        let (start_date, end_date) = ordered(start, end);
        if start_date == end_date {
            return None;
        }
        let span_days = u32::try_from((end_date - start_date).num_days() + 1).ok()?;
        Some(SpanInfo {
            start_date,
            end_date,
            span_days,
        })
    }

    /* ------------------------------ Lanes ------------------------------ */

    /// Greedy interval partitioning over header events (all-day and multi-day).
    ///
    /// Sorted by start day, longer spans first on ties; each event takes the lowest lane
    /// whose occupants it does not intersect (inclusive day ranges).
    ///
    /// The result is positional: `lanes[i]` belongs to `records[i]`, so duplicate ids
    /// cannot share a slot. Timed events stay in lane 0.
    pub fn assign_lanes(records: &[ProcessedRecord]) -> Vec<usize> {
        let mut header: Vec<(usize, &ProcessedRecord)> = records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.render_type.is_header())
            .collect();
        header.sort_by(|(_, a), (_, b)| {
            a.start_date
                .cmp(&b.start_date)
                .then_with(|| span_len(b).cmp(&span_len(a)))
        });

        let mut lanes: Vec<Vec<(NaiveDate, NaiveDate)>> = Vec::new();
        let mut out = vec![0; records.len()];
        for (position, record) in header {
            let (start, end) = (record.start_date, record.end_date);
            let free = lanes.iter().position(|occupants| {
                occupants
                    .iter()
                    .all(|&(taken_start, taken_end)| !(start <= taken_end && end >= taken_start))
            });
            let lane = match free {
                Some(lane) => lane,
                None => {
                    lanes.push(Vec::new());
                    lanes.len() - 1
                }
            };
            lanes[lane].push((start, end));
            out[position] = lane;
        }
        out
    }

    fn span_len(record: &ProcessedRecord) -> i64 {
        (record.end_date - record.start_date).num_days() + 1
    }

    /* ----------------------------- Timeline ----------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct TimelineColumn {
        pub column: usize,
        pub total_columns: usize,
    }

    /// Side-by-side columns for overlapping single-day timed events. Header events,
    /// multi-day timed ones included, are skipped.
    ///
    /// Events sorted by start form clusters while each start precedes the running max end;
    /// a cluster of `n` events gets `n` equal columns in sort order.
    pub fn calculate_timeline_columns(
        events: &[ProcessedRecord],
    ) -> IndexMap<String, TimelineColumn> {
        let mut timed: Vec<(&ProcessedRecord, &TimeInfo)> = events
            .iter()
            .filter(|e| e.render_type == RenderType::Timed)
            .filter_map(|e| e.time_info.as_ref().map(|t| (e, t)))
            .collect();
        timed.sort_by_key(|(_, t)| t.start_time);

        let mut out = IndexMap::new();
        let mut cluster: Vec<&ProcessedRecord> = Vec::new();
        let mut cluster_end: Option<NaiveDateTime> = None;
        for (event, time) in timed {
            match cluster_end {
                Some(end) if time.start_time < end => {
                    cluster.push(event);
                    cluster_end = Some(end.max(time.end_time));
                }
                _ => {
                    flush_cluster(&mut cluster, &mut out);
                    cluster.push(event);
                    cluster_end = Some(time.end_time);
                }
            }
        }
        flush_cluster(&mut cluster, &mut out);
        out
    }

    fn flush_cluster(
        cluster: &mut Vec<&ProcessedRecord>,
        out: &mut IndexMap<String, TimelineColumn>,
    ) {
        let total_columns = cluster.len();
        for (column, event) in cluster.drain(..).enumerate() {
            out.insert(
                event.id().to_string(),
                TimelineColumn {
                    column,
                    total_columns,
                },
            );
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::logging::{LogLevel, NoopLogger, RecordingLogger};

        fn d(y: i32, m: u32, day: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, day).unwrap()
        }

        fn at(y: i32, m: u32, day: u32, h: u32, min: u32) -> NaiveDateTime {
            d(y, m, day).and_hms_opt(h, min, 0).unwrap()
        }

        fn processor() -> CalendarDataProcessor {
            CalendarDataProcessor::new(CalendarConfig::default(), Arc::new(NoopLogger))
        }

        fn run(record: DataRecord) -> Option<ProcessedRecord> {
            processor().process_record(&Arc::new(record))
        }

        fn span(id: &str, start: &str, end: &str) -> DataRecord {
            DataRecord::new(id)
                .with_value("startDate", start)
                .with_value("endDate", end)
        }

        fn until(id: &str, start: &str, end_time: &str) -> DataRecord {
            DataRecord::new(id)
                .with_value("date", start)
                .with_value("endTime", end_time)
        }

        #[test]
        fn single_sided_dates_fill_each_other() {
            let only_start =
                run(DataRecord::new("a").with_value("startDate", "2026-02-07")).unwrap();
            assert_eq!(only_start.start_date, d(2026, 2, 7));
            assert_eq!(only_start.end_date, d(2026, 2, 7));
            assert!(only_start.span_info.is_none());
            assert_eq!(only_start.render_type, RenderType::AllDay);

            let only_end = run(DataRecord::new("b").with_value("endDate", "2026-02-09")).unwrap();
            assert_eq!((only_end.start_date, only_end.end_date), (d(2026, 2, 9), d(2026, 2, 9)));
            assert!(only_end.span_info.is_none());
        }

        #[test]
        fn records_without_dates_are_dropped() {
            assert!(run(DataRecord::new("a").with_value("title", "no dates")).is_none());
            assert!(run(DataRecord::new("b").with_value("date", "someday")).is_none());
        }

        #[test]
        fn start_field_priority_follows_config_then_candidates() {
            let record = DataRecord::new("a")
                .with_value("scheduled", "2026-02-03")
                .with_value("deadline", "2026-02-02")
                .with_value("begins", "2026-02-01");
            assert_eq!(run(record.clone()).unwrap().start_date, d(2026, 2, 2));

            let configured = CalendarDataProcessor::new(
                CalendarConfig {
                    start_date_field: Some("begins".into()),
                    ..CalendarConfig::default()
                },
                Arc::new(NoopLogger),
            );
            let processed = configured.process_record(&Arc::new(record.clone())).unwrap();
            assert_eq!(processed.start_date, d(2026, 2, 1));

            let legacy = CalendarDataProcessor::new(
                CalendarConfig {
                    date_field: Some("scheduled".into()),
                    ..CalendarConfig::default()
                },
                Arc::new(NoopLogger),
            );
            assert_eq!(legacy.process_record(&Arc::new(record)).unwrap().start_date, d(2026, 2, 3));
        }

        #[test]
        fn missing_end_time_defaults_to_one_hour() {
            let p = run(DataRecord::new("a")
                .with_value("date", "2026-02-07")
                .with_value("startTime", "09:15"))
            .unwrap();
            let time = p.time_info.expect("timed");
            assert_eq!(time.start_time, at(2026, 2, 7, 9, 15));
            assert_eq!(time.end_time, at(2026, 2, 7, 10, 15));
            assert_eq!(time.duration_minutes, 60);
            assert!(!time.has_embedded_time);
            assert_eq!(p.render_type, RenderType::Timed);
        }

        #[test]
        fn embedded_time_beats_time_fields() {
            let p = run(DataRecord::new("a")
                .with_value("startDate", "2026-02-07T14:00")
                .with_value("endDate", "2026-02-07T15:30")
                .with_value("startTime", "08:00"))
            .unwrap();
            let time = p.time_info.expect("timed");
            assert_eq!(time.start_time, at(2026, 2, 7, 14, 0));
            assert_eq!(time.end_time, at(2026, 2, 7, 15, 30));
            assert_eq!(time.duration_minutes, 90);
            assert!(time.has_embedded_time);
        }

        #[test]
        fn overnight_events_roll_end_forward() {
            let p = run(DataRecord::new("a")
                .with_value("date", "2026-02-07")
                .with_value("startTime", "23:00")
                .with_value("endTime", "01:00"))
            .unwrap();
            let time = p.time_info.expect("timed");
            assert_eq!(time.duration_minutes, 120);
            assert_eq!(time.end_time.date(), d(2026, 2, 8));
            assert_eq!(p.render_type, RenderType::Timed);
        }

        #[test]
        fn zero_length_ranges_become_an_hour() {
            let p = run(DataRecord::new("a")
                .with_value("date", "2026-02-07")
                .with_value("startTime", "10:00")
                .with_value("endTime", "10:00"))
            .unwrap();
            assert_eq!(p.time_info.unwrap().duration_minutes, 60);
        }

        #[test]
        fn end_time_alone_still_makes_an_event_timed() {
            let p = run(DataRecord::new("a")
                .with_value("date", "2026-02-07")
                .with_value("endTime", "11:00"))
            .unwrap();
            let time = p.time_info.expect("timed");
            assert_eq!(time.start_time, at(2026, 2, 7, 10, 0));
            assert_eq!(time.end_time, at(2026, 2, 7, 11, 0));
        }

        #[test]
        fn render_type_is_a_function_of_span_and_time() {
            let multi_all_day = run(DataRecord::new("a")
                .with_value("startDate", "2026-02-07")
                .with_value("endDate", "2026-02-09"))
            .unwrap();
            assert_eq!(multi_all_day.render_type, RenderType::MultiDayAllday);
            assert_eq!(multi_all_day.span_info.as_ref().unwrap().span_days, 3);

            let multi_timed = run(DataRecord::new("b")
                .with_value("startDate", "2026-02-07T09:00")
                .with_value("endDate", "2026-02-08T17:00"))
            .unwrap();
            assert_eq!(multi_timed.render_type, RenderType::MultiDayTimed);
        }

        #[test]
        fn reversed_ranges_are_swapped() {
            let p = run(DataRecord::new("a")
                .with_value("startDate", "2026-02-10")
                .with_value("endDate", "2026-02-07"))
            .unwrap();
            assert_eq!((p.start_date, p.end_date), (d(2026, 2, 7), d(2026, 2, 10)));
            assert_eq!(p.span_info.unwrap().span_days, 4);
        }

        #[test]
        fn color_priority_is_field_then_color_then_callback() {
            let config = CalendarConfig {
                event_color_field: Some("tint".into()),
                ..CalendarConfig::default()
            };
            let processor = CalendarDataProcessor::new(config, Arc::new(NoopLogger))
                .with_color_resolver(|r| (r.id == "c").then(|| "#00ff00".to_string()));
            let color =
                |record: DataRecord| processor.process_record(&Arc::new(record)).unwrap().color;

            let base = |id: &str| DataRecord::new(id).with_value("date", "2026-02-07");
            let tinted = base("a")
                .with_value("tint", "red")
                .with_value("color", "blue");
            assert_eq!(color(tinted).as_deref(), Some("red"));
            assert_eq!(color(base("b").with_value("color", "blue")).as_deref(), Some("blue"));
            assert_eq!(color(base("c")).as_deref(), Some("#00ff00"));
            assert_eq!(color(base("d")), None);
        }

        #[test]
        fn disjoint_events_share_lane_zero_and_overlaps_split() {
            let frame = DataFrame::from_records([
                span("a", "2026-02-01", "2026-02-03"),
                span("b", "2026-02-04", "2026-02-05"),
                DataRecord::new("c").with_value("date", "2026-02-03"),
            ]);
            let data = processor().process(&frame);
            assert_eq!(data.index["a"].lane, 0);
            assert_eq!(data.index["b"].lane, 0);
            assert_eq!(data.index["c"].lane, 1);
            assert_eq!(data.max_lane, 1);
        }

        #[test]
        fn longer_spans_win_lower_lanes_on_ties() {
            let frame = DataFrame::from_records([
                DataRecord::new("short").with_value("date", "2026-02-01"),
                span("long", "2026-02-01", "2026-02-05"),
            ]);
            let data = processor().process(&frame);
            assert_eq!(data.index["long"].lane, 0);
            assert_eq!(data.index["short"].lane, 1);
        }

        #[test]
        fn timed_events_do_not_take_lanes() {
            let frame = DataFrame::from_records([
                DataRecord::new("timed").with_value("date", "2026-02-01T09:00"),
                DataRecord::new("all").with_value("date", "2026-02-01"),
            ]);
            let data = processor().process(&frame);
            assert_eq!(data.index["all"].lane, 0);
            assert_eq!(data.max_lane, 0);
            assert_eq!(data.header_events_on(d(2026, 2, 1)).len(), 1);
            assert_eq!(data.timed_events_on(d(2026, 2, 1)).len(), 1);
        }

        #[test]
        fn grouping_replicates_multi_day_events() {
            let frame = DataFrame::from_records([DataRecord::new("trip")
                .with_value("startDate", "2026-02-27")
                .with_value("endDate", "2026-03-02")]);
            let data = processor().process(&frame);
            let keys: Vec<_> = data.grouped.keys().cloned().collect();
            assert_eq!(keys, ["2026-02-27", "2026-02-28", "2026-03-01", "2026-03-02"]);
            assert_eq!(data.processed.len(), 1);
        }

        #[test]
        fn runaway_spans_are_capped_with_a_warning() {
            let logger = Arc::new(RecordingLogger::new());
            let processor = CalendarDataProcessor::new(CalendarConfig::default(), logger.clone());
            let frame = DataFrame::from_records([DataRecord::new("forever")
                .with_value("startDate", "2020-01-01")
                .with_value("endDate", "2029-12-31")]);
            let data = processor.process(&frame);
            assert_eq!(data.grouped.len(), MAX_SPAN_DAYS as usize);
            assert_eq!(logger.messages_at(LogLevel::Warn).len(), 1);
        }

        #[test]
        fn timeline_columns_pack_overlap_clusters() {
            let frame = DataFrame::from_records([
                until("a", "2026-02-07T09:00", "10:30"),
                until("b", "2026-02-07T10:00", "11:00"),
                until("c", "2026-02-07T10:45", "11:15"),
                DataRecord::new("d").with_value("date", "2026-02-07T13:00"),
            ]);
            let data = processor().process(&frame);
            let columns = calculate_timeline_columns(data.events_on(d(2026, 2, 7)));
            let col = |id: &str| columns[id];
            assert_eq!(col("a"), TimelineColumn { column: 0, total_columns: 3 });
            assert_eq!(col("b"), TimelineColumn { column: 1, total_columns: 3 });
            assert_eq!(col("c"), TimelineColumn { column: 2, total_columns: 3 });
            assert_eq!(col("d"), TimelineColumn { column: 0, total_columns: 1 });
        }

        #[test]
        fn configured_timezone_moves_instants_across_midnight() {
            let config = CalendarConfig {
                timezone: chrono::FixedOffset::east_opt(2 * 3600),
                ..CalendarConfig::default()
            };
            let shifted = CalendarDataProcessor::new(config, Arc::new(NoopLogger));
            let frame = DataFrame::from_records([DataRecord::new("late")
                .with_value("startDate", "2026-02-07T23:30:00Z")]);
            let data = shifted.process(&frame);

            let late = &data.index["late"];
            assert_eq!(late.start_date, d(2026, 2, 8));
            assert_eq!(late.render_type, RenderType::Timed);
            let time = late.time_info.as_ref().expect("timed");
            assert_eq!(time.start_time, at(2026, 2, 8, 1, 30));
            assert_eq!(time.end_time, at(2026, 2, 8, 2, 30));
            assert!(data.grouped.contains_key("2026-02-08"));
            assert!(!data.grouped.contains_key("2026-02-07"));

            let naive = processor().process(&frame);
            assert_eq!(naive.index["late"].start_date, d(2026, 2, 7));
        }

        #[test]
        fn repeated_ids_keep_their_own_lanes() {
            let frame = DataFrame::from_records([
                DataRecord::new("dup").with_value("date", "2026-02-03"),
                DataRecord::new("dup").with_value("date", "2026-02-03"),
                DataRecord::new("timed").with_value("date", "2026-02-03T09:00"),
            ]);
            let data = processor().process(&frame);
            let lanes: Vec<usize> = data.processed.iter().map(|p| p.lane).collect();
            assert_eq!(lanes, [0, 1, 0]);
            assert_eq!(data.max_lane, 1);
            assert_eq!(assign_lanes(&data.processed), [0, 1, 0]);
        }

        #[test]
        fn timeline_skips_multi_day_timed_events() {
            let frame = DataFrame::from_records([
                span("retreat", "2026-02-06T09:00", "2026-02-08T17:00"),
                DataRecord::new("call").with_value("date", "2026-02-07T10:00"),
            ]);
            let data = processor().process(&frame);
            assert_eq!(data.events_on(d(2026, 2, 7)).len(), 2);
            let columns = calculate_timeline_columns(data.events_on(d(2026, 2, 7)));
            assert_eq!(columns.len(), 1);
            assert_eq!(columns["call"], TimelineColumn { column: 0, total_columns: 1 });
        }

        #[test]
        fn touching_timed_events_do_not_cluster() {
            let frame = DataFrame::from_records([
                DataRecord::new("a").with_value("date", "2026-02-07T09:00"),
                DataRecord::new("b").with_value("date", "2026-02-07T10:00"),
            ]);
            let data = processor().process(&frame);
            let columns = calculate_timeline_columns(&data.processed);
            assert_eq!(columns["a"].total_columns, 1);
            assert_eq!(columns["b"].total_columns, 1);
        }
    }
}

pub mod duplicate {
    //! Duplicate-event preview: speculative phantom clones across selected dates, with
    //! collision checks against the existing calendar.
    //!
    //! Phantoms are never persisted. Every mutation regenerates phantoms and collisions
    //! from the current selection and edited time; nothing is patched incrementally.

    use crate::model::{
        DataRecord, ProcessedCalendarData, ProcessedRecord, RenderType, SpanInfo, TimeInfo,
        date_key, parse_date_key,
    };
    use crate::processor::normalize_time_range;
    use chrono::{Days, Duration, NaiveDate, NaiveDateTime, NaiveTime};
    use serde::{Deserialize, Serialize};
    use std::{
        collections::{BTreeMap, BTreeSet, HashSet},
        sync::Arc,
    };

    /* ------------------------------ Phantoms ------------------------------ */

    /// Time-of-day override applied to every phantom of a timed source.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct EditedTime {
        pub start_time: NaiveTime,
        pub end_time: NaiveTime,
    }

    pub fn phantom_id(source_id: &str, target: NaiveDate) -> String {
        format!("phantom_{source_id}_{}", date_key(target))
    }

    /// Clone `source` onto `target`, keeping its span length and time of day.
    ///
    /// Times are rebuilt by placing a time of day onto the new date, never by adding a
    /// day delta to the old instant. Edited times only apply to timed sources.
    pub fn create_phantom_record(
        source: &ProcessedRecord,
        target: NaiveDate,
        edited: Option<&EditedTime>,
    ) -> ProcessedRecord {
        let span_days = source.span_days();
        let end_date = target
            .checked_add_days(Days::new(u64::from(span_days.saturating_sub(1))))
            .unwrap_or(target);
        let span_info = source.span_info.as_ref().map(|_| SpanInfo {
            start_date: target,
            end_date,
            span_days,
        });
        let time_info = source
            .time_info
            .as_ref()
            .map(|time| retime(time, target, end_date, edited));
        let record = Arc::new(DataRecord {
            id: phantom_id(source.id(), target),
            values: source.record.values.clone(),
        });

        ProcessedRecord {
            record,
            render_type: RenderType::classify(span_info.is_some(), time_info.is_some()),
            start_date: target,
            end_date,
            time_info,
            span_info,
            color: source.color.clone(),
            lane: source.lane,
            is_phantom: true,
        }
    }

    /// Edited times land on the phantom's first and last day; the overnight roll only
    /// kicks in when those are the same day.
    fn retime(
        time: &TimeInfo,
        target: NaiveDate,
        end_date: NaiveDate,
        edited: Option<&EditedTime>,
    ) -> TimeInfo {
        let (start_time, end_time) = match edited {
            Some(edit) => normalize_time_range(
                target.and_time(edit.start_time),
                end_date.and_time(edit.end_time),
            ),
            None => {
                let day_offset = (time.end_time.date() - time.start_time.date()).num_days();
                let end_day = target + Duration::days(day_offset);
                (
                    target.and_time(time.start_time.time()),
                    end_day.and_time(time.end_time.time()),
                )
            }
        };
        TimeInfo {
            start_time,
            end_time,
            duration_minutes: (end_time - start_time).num_minutes().max(0),
            has_embedded_time: time.has_embedded_time,
        }
    }

    /// One phantom per parseable `YYYY-MM-DD` key, each regenerated independently.
    pub fn create_phantom_records_for_dates<I>(
        source: &ProcessedRecord,
        dates: I,
        edited: Option<&EditedTime>,
    ) -> BTreeMap<String, ProcessedRecord>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        dates
            .into_iter()
            .filter_map(|key| parse_date_key(key.as_ref()))
            .map(|day| (date_key(day), create_phantom_record(source, day, edited)))
            .collect()
    }

    /* ----------------------------- Collisions ----------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    #[serde(rename_all = "lowercase")]
    pub enum OverlapType {
        None,
        Allday,
        Time,
    }

    #[derive(Debug, Clone, PartialEq, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct CollisionInfo {
        pub date: String,
        pub overlap_type: OverlapType,
        pub overlapping_records: Vec<ProcessedRecord>,
    }

    /// Half-open interval test on unix seconds; touching endpoints do not overlap.
    fn times_overlap(a: &TimeInfo, b: &TimeInfo) -> bool {
        let secs = |at: NaiveDateTime| at.and_utc().timestamp();
        secs(a.start_time) < secs(b.end_time) && secs(b.start_time) < secs(a.end_time)
    }

    /// Compare a phantom against the events already on its date.
    ///
    /// Two timed events collide only when their intervals intersect; an all-day event on
    /// either side collides by sharing the date. A `Time` result is never downgraded.
    pub fn detect_collision<'a>(
        phantom: &ProcessedRecord,
        existing: impl IntoIterator<Item = &'a ProcessedRecord>,
    ) -> CollisionInfo {
        let mut overlap_type = OverlapType::None;
        let mut overlapping_records = Vec::new();
        for other in existing {
            if other.id() == phantom.id() {
                continue;
            }
            match (&phantom.time_info, &other.time_info) {
                (Some(mine), Some(theirs)) => {
                    if times_overlap(mine, theirs) {
                        overlap_type = OverlapType::Time;
                        overlapping_records.push(other.clone());
                    }
                }
                _ => {
                    if overlap_type != OverlapType::Time {
                        overlap_type = OverlapType::Allday;
                    }
                    overlapping_records.push(other.clone());
                }
            }
        }
        CollisionInfo {
            date: date_key(phantom.start_date),
            overlap_type,
            overlapping_records,
        }
    }

    /// Check each phantom against every day it covers; only colliding dates are kept.
    pub fn detect_collisions_for_phantoms(
        phantoms: &BTreeMap<String, ProcessedRecord>,
        grouped: &BTreeMap<String, Vec<ProcessedRecord>>,
    ) -> BTreeMap<String, CollisionInfo> {
        let mut out = BTreeMap::new();
        for (date, phantom) in phantoms {
            let mut seen = HashSet::new();
            let candidates: Vec<&ProcessedRecord> = phantom
                .days()
                .filter_map(|day| grouped.get(&date_key(day)))
                .flatten()
                .filter(|existing| seen.insert(existing.id()))
                .collect();
            let mut collision = detect_collision(phantom, candidates);
            if collision.overlap_type != OverlapType::None {
                collision.date = date.clone();
                out.insert(date.clone(), collision);
            }
        }
        out
    }

    pub fn has_critical_collisions(collisions: &BTreeMap<String, CollisionInfo>) -> bool {
        collisions
            .values()
            .any(|c| c.overlap_type == OverlapType::Time)
    }

    /* ------------------------------ Selection ------------------------------ */

    fn span_window(start: NaiveDate, span_days: u32) -> Vec<String> {
        start
            .iter_days()
            .take(span_days as usize)
            .map(date_key)
            .collect()
    }

    /// Toggle a whole `span_days` window at `clicked`.
    ///
    /// Windows starting at `clicked` and up to `span_days - 1` days earlier are probed;
    /// the first one that is fully selected is removed. Otherwise a new window starting
    /// at `clicked` is added.
    pub fn handle_multi_day_selection(
        selected: &BTreeSet<String>,
        clicked: NaiveDate,
        span_days: u32,
    ) -> BTreeSet<String> {
        let span_days = span_days.max(1);
        let placed = (0..span_days)
            .filter_map(|back| clicked.checked_sub_days(Days::new(u64::from(back))))
            .map(|start| span_window(start, span_days))
            .find(|window| window.iter().all(|day| selected.contains(day)));

        let mut next = selected.clone();
        match placed {
            Some(window) => {
                for day in &window {
                    next.remove(day);
                }
            }
            None => next.extend(span_window(clicked, span_days)),
        }
        next
    }

    /// Collapse selected days back into span starts, consuming up to `span_days`
    /// consecutive days per span in chronological order.
    pub fn get_span_start_dates(selected: &BTreeSet<String>, span_days: u32) -> Vec<NaiveDate> {
        let span_days = span_days.max(1);
        let mut days: Vec<NaiveDate> = selected.iter().filter_map(|k| parse_date_key(k)).collect();
        days.sort();
        days.dedup();

        let mut starts = Vec::new();
        let mut i = 0;
        while i < days.len() {
            let start = days[i];
            starts.push(start);
            i += 1;
            let mut consumed = 1;
            while i < days.len()
                && consumed < span_days
                && start.checked_add_days(Days::new(u64::from(consumed))) == Some(days[i])
            {
                i += 1;
                consumed += 1;
            }
        }
        starts
    }

    /* -------------------------------- Store -------------------------------- */

    #[derive(Debug, thiserror::Error, PartialEq, Eq)]
    pub enum DuplicateError {
        #[error("no duplicate session is active")]
        NotInitialized,
        #[error("event `{0}` has no time of day to edit")]
        MissingTimeInfo(String),
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct DuplicateState {
        pub source_record: ProcessedRecord,
        pub source_date: NaiveDate,
        pub edited_time: Option<EditedTime>,
        pub selected_dates: BTreeSet<String>,
        pub hovered_date: Option<NaiveDate>,
        pub phantom_records: BTreeMap<String, ProcessedRecord>,
        pub collisions: BTreeMap<String, CollisionInfo>,
    }

    /// A confirmed duplicate for the host to persist.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct DuplicateRequest {
        pub source_id: String,
        pub start_date: NaiveDate,
        pub end_date: NaiveDate,
        pub start_time: Option<NaiveDateTime>,
        pub end_time: Option<NaiveDateTime>,
    }

    /// Stateful duplicate workflow: `init` → toggles / time edits → `reset`.
    ///
    /// The existing-data snapshot is cached beside the state so regenerating phantoms
    /// never re-runs the processor.
    #[derive(Debug, Default)]
    pub struct DuplicateStore {
        state: Option<DuplicateState>,
        existing: Option<ProcessedCalendarData>,
    }

    impl DuplicateStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn init(
            &mut self,
            source: ProcessedRecord,
            source_date: NaiveDate,
            existing: ProcessedCalendarData,
        ) {
            self.state = Some(DuplicateState {
                source_record: source,
                source_date,
                edited_time: None,
                selected_dates: BTreeSet::new(),
                hovered_date: None,
                phantom_records: BTreeMap::new(),
                collisions: BTreeMap::new(),
            });
            self.existing = Some(existing);
        }

        pub fn reset(&mut self) {
            self.state = None;
            self.existing = None;
        }

        pub fn is_active(&self) -> bool {
            self.state.is_some()
        }

        pub fn state(&self) -> Option<&DuplicateState> {
            self.state.as_ref()
        }

        /// Multi-day sources toggle whole spans; single-day sources toggle one date.
        pub fn toggle_date(&mut self, date: NaiveDate) -> Result<(), DuplicateError> {
            let state = self.state.as_mut().ok_or(DuplicateError::NotInitialized)?;
            let span_days = state.source_record.span_days();
            if span_days > 1 {
                state.selected_dates =
                    handle_multi_day_selection(&state.selected_dates, date, span_days);
            } else {
                let key = date_key(date);
                if !state.selected_dates.remove(&key) {
                    state.selected_dates.insert(key);
                }
            }
            self.regenerate()
        }

        pub fn set_hovered_date(&mut self, date: Option<NaiveDate>) -> Result<(), DuplicateError> {
            let state = self.state.as_mut().ok_or(DuplicateError::NotInitialized)?;
            state.hovered_date = date;
            Ok(())
        }

        /// Phantom for the hovered date, unless that date is already part of the selection.
        pub fn hover_preview(&self) -> Option<ProcessedRecord> {
            let state = self.state.as_ref()?;
            let hovered = state.hovered_date?;
            if state.selected_dates.contains(&date_key(hovered)) {
                return None;
            }
            Some(create_phantom_record(
                &state.source_record,
                hovered,
                state.edited_time.as_ref(),
            ))
        }

        /// Move the start while keeping the current duration.
        pub fn set_start_time(&mut self, start: NaiveTime) -> Result<(), DuplicateError> {
            let current = self.current_time()?;
            let mut length = current.end_time - current.start_time;
            if length <= Duration::zero() {
                length += Duration::days(1);
            }
            self.set_edited_time(EditedTime {
                start_time: start,
                end_time: start + length,
            })
        }

        pub fn set_end_time(&mut self, end: NaiveTime) -> Result<(), DuplicateError> {
            let current = self.current_time()?;
            self.set_edited_time(EditedTime {
                start_time: current.start_time,
                end_time: end,
            })
        }

        pub fn reset_time(&mut self) -> Result<(), DuplicateError> {
            let state = self.state.as_mut().ok_or(DuplicateError::NotInitialized)?;
            state.edited_time = None;
            self.regenerate()
        }

        /// Edited time if set, otherwise the source's own time of day.
        pub fn current_time(&self) -> Result<EditedTime, DuplicateError> {
            let state = self.state.as_ref().ok_or(DuplicateError::NotInitialized)?;
            if let Some(edited) = state.edited_time {
                return Ok(edited);
            }
            let time = state
                .source_record
                .time_info
                .as_ref()
                .ok_or_else(|| DuplicateError::MissingTimeInfo(state.source_record.id().into()))?;
            Ok(EditedTime {
                start_time: time.start_time.time(),
                end_time: time.end_time.time(),
            })
        }

        fn set_edited_time(&mut self, edited: EditedTime) -> Result<(), DuplicateError> {
            let state = self.state.as_mut().ok_or(DuplicateError::NotInitialized)?;
            if state.source_record.time_info.is_none() {
                return Err(DuplicateError::MissingTimeInfo(
                    state.source_record.id().into(),
                ));
            }
            state.edited_time = Some(edited);
            self.regenerate()
        }

        fn regenerate(&mut self) -> Result<(), DuplicateError> {
            let Self { state, existing } = self;
            let state = state.as_mut().ok_or(DuplicateError::NotInitialized)?;
            let span_days = state.source_record.span_days();
            let starts: Vec<String> = if span_days > 1 {
                get_span_start_dates(&state.selected_dates, span_days)
                    .into_iter()
                    .map(date_key)
                    .collect()
            } else {
                state.selected_dates.iter().cloned().collect()
            };
            state.phantom_records = create_phantom_records_for_dates(
                &state.source_record,
                &starts,
                state.edited_time.as_ref(),
            );
            state.collisions = match existing {
                Some(data) => detect_collisions_for_phantoms(&state.phantom_records, &data.grouped),
                None => BTreeMap::new(),
            };
            Ok(())
        }

        pub fn phantom_records(&self) -> Option<&BTreeMap<String, ProcessedRecord>> {
            self.state.as_ref().map(|s| &s.phantom_records)
        }

        pub fn collisions(&self) -> Option<&BTreeMap<String, CollisionInfo>> {
            self.state.as_ref().map(|s| &s.collisions)
        }

        pub fn has_critical_collisions(&self) -> bool {
            self.collisions().is_some_and(has_critical_collisions)
        }

        /// The cached snapshot with phantoms overlaid; the snapshot itself is untouched.
        pub fn get_merged_data(&self) -> Option<ProcessedCalendarData> {
            let existing = self.existing.as_ref()?;
            let mut merged = existing.clone();
            let Some(state) = &self.state else {
                return Some(merged);
            };
            for phantom in state.phantom_records.values() {
                for day in phantom.days() {
                    merged
                        .grouped
                        .entry(date_key(day))
                        .or_default()
                        .push(phantom.clone());
                }
                merged
                    .index
                    .insert(phantom.id().to_string(), phantom.clone());
                merged.processed.push(phantom.clone());
            }
            Some(merged)
        }

        pub fn pending_duplicates(&self) -> Vec<DuplicateRequest> {
            let Some(state) = &self.state else {
                return vec![];
            };
            state
                .phantom_records
                .values()
                .map(|phantom| DuplicateRequest {
                    source_id: state.source_record.id().to_string(),
                    start_date: phantom.start_date,
                    end_date: phantom.end_date,
                    start_time: phantom.time_info.as_ref().map(|t| t.start_time),
                    end_time: phantom.time_info.as_ref().map(|t| t.end_time),
                })
                .collect()
        }
    }

}
