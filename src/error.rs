use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GridError>;

#[derive(Debug, Error)]
pub enum GridError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("no price data for {symbol} between {start} and {end}")]
    DataUnavailable {
        symbol: String,
        start: NaiveDate,
        end: NaiveDate,
    },

    #[error("price source failure: {0}")]
    DataSource(String),

    #[error("invalid date '{0}', expected YYYY-MM-DD")]
    InvalidDate(String),

    #[error("trading calendar unavailable: {0}")]
    Calendar(String),
}

/// Coarse error category handed to UI layers alongside the message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Data,
    Date,
    Calendar,
}

impl GridError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GridError::InvalidParameter(_) => ErrorKind::Validation,
            GridError::DataUnavailable { .. } | GridError::DataSource(_) => ErrorKind::Data,
            GridError::InvalidDate(_) => ErrorKind::Date,
            GridError::Calendar(_) => ErrorKind::Calendar,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        GridError::InvalidParameter(msg.into())
    }
}

pub fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| GridError::InvalidDate(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_variants() {
        let d = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let err = GridError::DataUnavailable {
            symbol: "159300".to_string(),
            start: d,
            end: d,
        };
        assert_eq!(err.kind(), ErrorKind::Data);
        assert_eq!(GridError::invalid("x").kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("159300"));
    }

    #[test]
    fn parse_date_rejects_garbage() {
        assert!(parse_date("2024-13-01").is_err());
        assert!(matches!(parse_date("20240101"), Err(GridError::InvalidDate(_))));
        assert_eq!(
            parse_date(" 2024-10-15 ").unwrap(),
            NaiveDate::from_ymd_opt(2024, 10, 15).unwrap()
        );
    }
}
