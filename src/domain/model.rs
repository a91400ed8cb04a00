use crate::utils::error::{LingxunError, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 姓名留空時送給後端的預設值
pub const PLACEHOLDER_NAME: &str = "未填写";

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H:%M:%S";
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// 農曆年份只接受今年往前數 150 年
pub const LUNAR_YEAR_SPAN: i32 = 150;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gender {
    #[serde(rename = "男")]
    Male,
    #[serde(rename = "女")]
    Female,
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Gender::Male => f.write_str("男"),
            Gender::Female => f.write_str("女"),
        }
    }
}

impl FromStr for Gender {
    type Err = LingxunError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "男" | "male" | "m" => Ok(Gender::Male),
            "女" | "female" | "f" => Ok(Gender::Female),
            other => Err(LingxunError::InvalidConfigValueError {
                field: "gender".to_string(),
                value: other.to_string(),
                reason: "expected male/female (男/女)".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CalendarMode {
    #[default]
    Solar,
    Lunar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LunarDate {
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub day: Option<u32>,
}

/// 出生資料表單。兩種曆法的欄位同時保留，切換模式不會清掉另一邊的值，
/// 只有目前模式的欄位會進到 payload。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BirthForm {
    pub name: String,
    pub gender: Option<Gender>,
    pub calendar: CalendarMode,
    pub solar_date: Option<NaiveDate>,
    pub lunar: LunarDate,
    pub time: Option<NaiveTime>,
}

impl BirthForm {
    pub fn is_lunar(&self) -> bool {
        self.calendar == CalendarMode::Lunar
    }

    pub fn set_calendar(&mut self, mode: CalendarMode) {
        self.calendar = mode;
    }

    pub fn display_name(&self) -> &str {
        let trimmed = self.name.trim();
        if trimmed.is_empty() {
            PLACEHOLDER_NAME
        } else {
            trimmed
        }
    }

    /// 用歷史記錄回填表單。地區由 `RegionCascade::restore` 另外處理。
    pub fn fill_from_history(&mut self, entry: &HistoryEntry) -> Result<()> {
        self.name = entry.name.clone();
        self.gender = Some(entry.gender);

        if entry.is_lunar {
            self.calendar = CalendarMode::Lunar;
            self.lunar = LunarDate {
                year: entry.year,
                month: entry.month,
                day: entry.day,
            };
            let time = entry.time.as_deref().unwrap_or_default();
            self.time = Some(parse_history_field("time", time, |s| {
                NaiveTime::parse_from_str(s, TIME_FORMAT)
            })?);
        } else {
            self.calendar = CalendarMode::Solar;
            let birth_time = entry.birth_time.as_deref().unwrap_or_default();
            let moment = parse_history_field("birth_time", birth_time, |s| {
                NaiveDateTime::parse_from_str(s, DATETIME_FORMAT)
            })?;
            self.solar_date = Some(moment.date());
            self.time = Some(moment.time());
        }

        Ok(())
    }
}

fn parse_history_field<T>(
    field: &str,
    raw: &str,
    parse: impl FnOnce(&str) -> std::result::Result<T, chrono::ParseError>,
) -> Result<T> {
    parse(raw).map_err(|e| LingxunError::StorageError {
        message: format!("history entry has invalid {} '{}': {}", field, raw, e),
    })
}

/// 三層地區代碼快照，歷史記錄回放時使用
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocationCodes {
    pub province: String,
    pub city: String,
    pub area: String,
}

/// 送往 `/analyze/stream` 的請求內容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisPayload {
    pub name: String,
    pub gender: Gender,
    pub birth_location: String,
    pub is_lunar: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub month: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day: Option<u32>,
    /// 公曆: "YYYY-MM-DD HH:MM:SS"，農曆: "HH:MM:SS"
    pub birth_time: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub name: String,
    pub gender: Gender,
    pub birth_location: String,
    pub is_lunar: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub birth_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub month: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub province_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area_code: Option<String>,
}

impl HistoryEntry {
    pub fn from_payload(
        payload: &AnalysisPayload,
        location: &LocationCodes,
        created_at: DateTime<Utc>,
    ) -> Self {
        let non_empty = |code: &str| (!code.is_empty()).then(|| code.to_string());
        let (birth_time, time) = if payload.is_lunar {
            (None, Some(payload.birth_time.clone()))
        } else {
            (Some(payload.birth_time.clone()), None)
        };

        Self {
            id: created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            name: payload.name.clone(),
            gender: payload.gender,
            birth_location: payload.birth_location.clone(),
            is_lunar: payload.is_lunar,
            birth_time,
            year: payload.year,
            month: payload.month,
            day: payload.day,
            time,
            province_code: non_empty(&location.province),
            city_code: non_empty(&location.city),
            area_code: non_empty(&location.area),
        }
    }
}
