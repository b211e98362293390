use super::money::Amount;
use crate::error::PayrollError;
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Registry identifier for a payee.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayeeId(pub String);

impl fmt::Display for PayeeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PayeeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "kebab-case")]
pub enum ScheduleKind {
    Weekly,
    #[serde(alias = "biweekly")]
    BiWeekly,
    Monthly,
}

/// Calendar rules deciding on which dates each schedule kind is due.
///
/// Weekly payees are paid on the anchor's weekday, bi-weekly payees every
/// fourteen days counted from the anchor, and monthly payees on
/// `monthly_pay_day` (clamped to the last day of shorter months).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayCalendar {
    pub monthly_pay_day: u32,
    pub cycle_anchor: NaiveDate,
}

impl Default for PayCalendar {
    fn default() -> Self {
        Self {
            monthly_pay_day: 15,
            cycle_anchor: NaiveDate::from_ymd_opt(2024, 1, 5).unwrap_or(NaiveDate::MIN),
        }
    }
}

impl PayCalendar {
    pub fn is_due(&self, schedule: ScheduleKind, date: NaiveDate) -> bool {
        match schedule {
            ScheduleKind::Weekly => date.weekday() == self.cycle_anchor.weekday(),
            ScheduleKind::BiWeekly => (date - self.cycle_anchor).num_days().rem_euclid(14) == 0,
            ScheduleKind::Monthly => {
                date.day() == self.monthly_pay_day.clamp(1, last_day_of_month(date))
            }
        }
    }
}

fn last_day_of_month(date: NaiveDate) -> u32 {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}

/// A registered recipient of payroll disbursements.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct Payee {
    pub id: PayeeId,
    /// Opaque reference understood by the settlement network (wallet, IBAN...).
    pub destination_ref: String,
    pub amount: Amount,
    pub schedule: ScheduleKind,
    pub active: bool,
}

impl Payee {
    pub fn new(
        id: impl Into<String>,
        destination_ref: impl Into<String>,
        amount: Amount,
        schedule: ScheduleKind,
    ) -> Result<Self, PayrollError> {
        let payee = Self {
            id: PayeeId(id.into()),
            destination_ref: destination_ref.into(),
            amount,
            schedule,
            active: true,
        };
        payee.validate()?;
        Ok(payee)
    }

    pub fn validate(&self) -> Result<(), PayrollError> {
        if self.id.0.trim().is_empty() {
            return Err(PayrollError::ValidationError(
                "Payee id must not be empty".to_string(),
            ));
        }
        if self.id.0.contains(':') {
            return Err(PayrollError::ValidationError(format!(
                "Payee id '{}' must not contain ':'",
                self.id
            )));
        }
        if self.destination_ref.trim().is_empty() {
            return Err(PayrollError::ValidationError(format!(
                "Payee '{}' has no destination",
                self.id
            )));
        }
        Ok(())
    }

    pub fn is_due(&self, calendar: &PayCalendar, date: NaiveDate) -> bool {
        self.active && calendar.is_due(self.schedule, date)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_monthly_due_on_pay_day() {
        let calendar = PayCalendar::default();
        assert!(calendar.is_due(ScheduleKind::Monthly, date(2024, 11, 15)));
        assert!(!calendar.is_due(ScheduleKind::Monthly, date(2024, 11, 14)));
    }

    #[test]
    fn test_monthly_pay_day_clamped_to_month_end() {
        let calendar = PayCalendar {
            monthly_pay_day: 31,
            ..PayCalendar::default()
        };
        assert!(calendar.is_due(ScheduleKind::Monthly, date(2024, 2, 29)));
        assert!(calendar.is_due(ScheduleKind::Monthly, date(2023, 2, 28)));
        assert!(calendar.is_due(ScheduleKind::Monthly, date(2024, 12, 31)));
        assert!(!calendar.is_due(ScheduleKind::Monthly, date(2024, 12, 30)));
    }

    #[test]
    fn test_biweekly_counts_from_anchor() {
        let calendar = PayCalendar::default();
        assert!(calendar.is_due(ScheduleKind::BiWeekly, date(2024, 1, 5)));
        assert!(calendar.is_due(ScheduleKind::BiWeekly, date(2024, 1, 19)));
        assert!(!calendar.is_due(ScheduleKind::BiWeekly, date(2024, 1, 12)));
        assert!(calendar.is_due(ScheduleKind::BiWeekly, date(2023, 12, 22)));
    }

    #[test]
    fn test_weekly_matches_anchor_weekday() {
        let calendar = PayCalendar::default();
        assert!(calendar.is_due(ScheduleKind::Weekly, date(2024, 1, 12)));
        assert!(!calendar.is_due(ScheduleKind::Weekly, date(2024, 1, 13)));
    }

    #[test]
    fn test_inactive_payee_never_due() {
        let mut payee = Payee::new(
            "alice",
            "0x1234",
            Amount::new(dec!(5000)).unwrap(),
            ScheduleKind::Monthly,
        )
        .unwrap();
        let calendar = PayCalendar::default();
        assert!(payee.is_due(&calendar, date(2024, 11, 15)));
        payee.active = false;
        assert!(!payee.is_due(&calendar, date(2024, 11, 15)));
    }

    #[test]
    fn test_payee_validation() {
        let amount = Amount::new(dec!(1)).unwrap();
        assert!(Payee::new("", "dest", amount, ScheduleKind::Weekly).is_err());
        assert!(Payee::new("a:b", "dest", amount, ScheduleKind::Weekly).is_err());
        assert!(Payee::new("a", " ", amount, ScheduleKind::Weekly).is_err());
    }

    #[test]
    fn test_schedule_kind_names() {
        let kind: ScheduleKind = serde_json::from_str("\"bi-weekly\"").unwrap();
        assert_eq!(kind, ScheduleKind::BiWeekly);
        let kind: ScheduleKind = serde_json::from_str("\"biweekly\"").unwrap();
        assert_eq!(kind, ScheduleKind::BiWeekly);
    }
}
