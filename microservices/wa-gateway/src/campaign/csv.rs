//! Recipient-list parsing
//!
//! Streams the uploaded CSV row by row: phone-column detection against a
//! fixed list of common headers (first column as fallback), Brazilian
//! phone normalization, optional CPF validation, and template body
//! parameters matched case-insensitively against row columns.

use std::time::Duration;
use tracing::warn;
use zapgate_core::{is_valid_cpf, GatewayError, PhoneNumber, Result};

/// Column names commonly used for the recipient phone.
const PHONE_COLUMNS: [&str; 7] = [
    "phone",
    "telefone",
    "celular",
    "numero",
    "número",
    "whatsapp",
    "fone",
];

const CPF_COLUMN: &str = "cpf";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub phone: String,
    /// Template body parameters in the template's declared variable order.
    pub params: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ParsedRecipients {
    pub recipients: Vec<Recipient>,
    /// Rows dropped for an unresolvable phone or an invalid CPF.
    pub skipped: usize,
}

/// Parse the recipient list. A malformed CSV is an error (the campaign
/// fails); individual bad rows are skipped and logged.
pub fn parse_recipients(data: &[u8], template_variables: &[String]) -> Result<ParsedRecipients> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(data);

    let headers = reader
        .headers()
        .map_err(|e| GatewayError::Validation(format!("CSV header: {}", e)))?
        .clone();

    let phone_idx = headers
        .iter()
        .position(|h| {
            let lowered = h.to_lowercase();
            PHONE_COLUMNS.contains(&lowered.as_str())
        })
        .unwrap_or(0);

    let cpf_idx = headers
        .iter()
        .position(|h| h.eq_ignore_ascii_case(CPF_COLUMN));

    // Exact header match first, case-insensitive as the fallback
    let param_idxs: Vec<Option<usize>> = template_variables
        .iter()
        .map(|variable| {
            headers
                .iter()
                .position(|h| h == variable.as_str())
                .or_else(|| headers.iter().position(|h| h.eq_ignore_ascii_case(variable)))
        })
        .collect();

    let mut recipients = Vec::new();
    let mut skipped = 0usize;

    for (row, record) in reader.records().enumerate() {
        let record = record.map_err(|e| GatewayError::Validation(format!("CSV row: {}", e)))?;

        let raw_phone = record.get(phone_idx).unwrap_or_default();
        let Some(phone) = PhoneNumber::normalize(raw_phone) else {
            warn!(row, raw = raw_phone, "Row without a resolvable phone, skipping");
            skipped += 1;
            continue;
        };

        if let Some(idx) = cpf_idx {
            let cpf = record.get(idx).unwrap_or_default();
            if !cpf.is_empty() && !is_valid_cpf(cpf) {
                warn!(row, phone = %phone, "Row with invalid CPF, skipping");
                skipped += 1;
                continue;
            }
        }

        let params = param_idxs
            .iter()
            .map(|idx| {
                idx.and_then(|i| record.get(i))
                    .unwrap_or_default()
                    .to_string()
            })
            .collect();

        recipients.push(Recipient {
            phone: phone.into_string(),
            params,
        });
    }

    Ok(ParsedRecipients { recipients, skipped })
}

/// Linear pacing: the i-th recipient is delayed `i * (60000 / rate_limit)`
/// milliseconds, independent of the queue's own window limiter.
pub fn pacing_delay(index: usize, rate_limit: u32) -> Duration {
    if rate_limit == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(index as u64 * (60_000 / rate_limit as u64))
}
