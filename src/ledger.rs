use chrono::{Months, NaiveDate};
use serde::Serialize;
use serde_json::json;

pub const MIN_INSTALLMENTS: i64 = 1;
pub const MAX_INSTALLMENTS: i64 = 24;

pub const DATE_FMT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeStatus {
    Paid,
    Partial,
    Unpaid,
}

impl FeeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FeeStatus::Paid => "Paid",
            FeeStatus::Partial => "Partial",
            FeeStatus::Unpaid => "Unpaid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Paid" => Some(FeeStatus::Paid),
            "Partial" => Some(FeeStatus::Partial),
            "Unpaid" => Some(FeeStatus::Unpaid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentMethod {
    Cash,
    Card,
    Upi,
    Netbanking,
    Cheque,
}

impl PaymentMethod {
    pub const ALL: [PaymentMethod; 5] = [
        PaymentMethod::Cash,
        PaymentMethod::Card,
        PaymentMethod::Upi,
        PaymentMethod::Netbanking,
        PaymentMethod::Cheque,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Card => "card",
            PaymentMethod::Upi => "upi",
            PaymentMethod::Netbanking => "netbanking",
            PaymentMethod::Cheque => "cheque",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cash" => Some(PaymentMethod::Cash),
            "card" => Some(PaymentMethod::Card),
            "upi" => Some(PaymentMethod::Upi),
            "netbanking" => Some(PaymentMethod::Netbanking),
            "cheque" => Some(PaymentMethod::Cheque),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendanceStatus {
    Present,
    Absent,
    Late,
    Excused,
}

impl AttendanceStatus {
    pub const ALL: [AttendanceStatus; 4] = [
        AttendanceStatus::Present,
        AttendanceStatus::Absent,
        AttendanceStatus::Late,
        AttendanceStatus::Excused,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AttendanceStatus::Present => "Present",
            AttendanceStatus::Absent => "Absent",
            AttendanceStatus::Late => "Late",
            AttendanceStatus::Excused => "Excused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Present" => Some(AttendanceStatus::Present),
            "Absent" => Some(AttendanceStatus::Absent),
            "Late" => Some(AttendanceStatus::Late),
            "Excused" => Some(AttendanceStatus::Excused),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl LedgerError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        LedgerError {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Half-up rounding to a whole number, matching how the UI always rounded
/// rates and averages.
pub fn round_whole(x: f64) -> f64 {
    (x + 0.5).floor()
}

/// Half-up rounding to one decimal place, used for stored exam percentages.
pub fn round_1dp(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

pub fn parse_iso_date(s: &str) -> Result<NaiveDate, LedgerError> {
    NaiveDate::parse_from_str(s, DATE_FMT).map_err(|_| {
        LedgerError::new("bad_params", format!("invalid date: {s} (expected YYYY-MM-DD)"))
    })
}

pub fn clamp_installments(count: i64) -> i64 {
    count.clamp(MIN_INSTALLMENTS, MAX_INSTALLMENTS)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallmentPlan {
    pub installments: i64,
    pub installment_amt: f64,
    pub dates: Vec<String>,
}

/// Splits a total fee evenly across a bounded number of installments.
///
/// The caller either supplies the due-date sequence (validated to parse and
/// to match the clamped count) or a start date from which monthly dates are
/// generated, same day-of-month, clamped to the end of shorter months.
pub fn derive_installment_plan(
    total_fee: f64,
    count: i64,
    dates: Option<&[String]>,
    start: NaiveDate,
) -> Result<InstallmentPlan, LedgerError> {
    if !total_fee.is_finite() || total_fee < 0.0 {
        return Err(LedgerError::new("bad_params", "totalFee must be non-negative"));
    }
    let installments = clamp_installments(count);
    let installment_amt = total_fee / installments as f64;

    let dates = match dates {
        Some(given) => {
            if given.len() as i64 != installments {
                return Err(LedgerError::new(
                    "bad_params",
                    "installmentDates length must match installments",
                )
                .with_details(json!({
                    "expected": installments,
                    "got": given.len(),
                })));
            }
            for d in given {
                parse_iso_date(d)?;
            }
            given.to_vec()
        }
        None => {
            let mut generated = Vec::with_capacity(installments as usize);
            for i in 0..installments {
                let due = start
                    .checked_add_months(Months::new(i as u32))
                    .ok_or_else(|| LedgerError::new("bad_params", "installment date overflow"))?;
                generated.push(due.format(DATE_FMT).to_string());
            }
            generated
        }
    };

    Ok(InstallmentPlan {
        installments,
        installment_amt,
        dates,
    })
}

/// Derived three-state fee status: Paid iff the balance is settled and a fee
/// was actually set, Partial iff anything has been paid, else Unpaid.
pub fn fee_status(total_fee: f64, paid_fee: f64) -> FeeStatus {
    if total_fee > 0.0 && paid_fee >= total_fee {
        FeeStatus::Paid
    } else if paid_fee > 0.0 {
        FeeStatus::Partial
    } else {
        FeeStatus::Unpaid
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeSummary {
    pub total_amount: f64,
    pub amount_paid: f64,
    pub amount_due: f64,
    pub status: String,
    pub no_fee_set: bool,
}

/// Pure fee-table row for one student. Students with no fee configured are
/// reported as settled ("no fee due") rather than Unpaid.
pub fn fee_summary_row(total_fee: f64, paid_fee: f64) -> FeeSummary {
    let no_fee_set = !(total_fee > 0.0);
    let status = if no_fee_set {
        FeeStatus::Paid
    } else {
        fee_status(total_fee, paid_fee)
    };
    FeeSummary {
        total_amount: total_fee,
        amount_paid: paid_fee,
        amount_due: (total_fee - paid_fee).max(0.0),
        status: status.as_str().to_string(),
        no_fee_set,
    }
}

/// Validates a payment against the current balance and returns the new paid
/// total with its derived status. Overpayment past the remaining due is
/// rejected, not clamped.
pub fn apply_payment(
    total_fee: f64,
    paid_fee: f64,
    amount: f64,
) -> Result<(f64, FeeStatus), LedgerError> {
    if !amount.is_finite() || amount <= 0.0 {
        return Err(LedgerError::new("bad_params", "amount must be positive"));
    }
    let remaining = total_fee - paid_fee;
    if amount > remaining {
        return Err(
            LedgerError::new("bad_params", "amount exceeds remaining due").with_details(json!({
                "remainingDue": remaining.max(0.0),
            })),
        );
    }
    let new_paid = paid_fee + amount;
    Ok((new_paid, fee_status(total_fee, new_paid)))
}

/// Whole-percent attendance rate; 0 when nothing matched the filter.
pub fn attendance_rate(present: i64, total: i64) -> i64 {
    if total <= 0 {
        return 0;
    }
    round_whole(100.0 * present as f64 / total as f64) as i64
}

/// Stored percentage for one exam result, one decimal place.
pub fn exam_percentage(marks: f64, total_marks: f64) -> Result<f64, LedgerError> {
    if !total_marks.is_finite() || total_marks <= 0.0 {
        return Err(LedgerError::new("bad_params", "totalMarks must be positive"));
    }
    if !marks.is_finite() || marks < 0.0 || marks > total_marks {
        return Err(
            LedgerError::new("bad_params", "marks must be between 0 and totalMarks")
                .with_details(json!({ "totalMarks": total_marks })),
        );
    }
    Ok(round_1dp(100.0 * marks / total_marks))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceStats {
    pub exams_taken: i64,
    pub average: i64,
    pub highest: f64,
    pub lowest: f64,
}

/// Straight mean over already-normalized percentages; no weighting by the
/// marks an exam was out of. Empty input yields all zeros.
pub fn aggregate_performance(percentages: &[f64]) -> PerformanceStats {
    if percentages.is_empty() {
        return PerformanceStats {
            exams_taken: 0,
            average: 0,
            highest: 0.0,
            lowest: 0.0,
        };
    }
    let sum: f64 = percentages.iter().sum();
    let mut highest = f64::MIN;
    let mut lowest = f64::MAX;
    for &p in percentages {
        if p > highest {
            highest = p;
        }
        if p < lowest {
            lowest = p;
        }
    }
    PerformanceStats {
        exams_taken: percentages.len() as i64,
        average: round_whole(sum / percentages.len() as f64) as i64,
        highest,
        lowest,
    }
}
