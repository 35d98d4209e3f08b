//! Input validation for batch submissions.
//!
//! CPFs are normalized to 11 digits and check-digit validated, phones are
//! normalized to E.164 and birth dates to ISO format. Each provider needs a
//! different subset of the auxiliary fields.
use crate::errors::AppError;
use crate::models::{CpfRecord, Provider};
use chrono::NaiveDate;
use phonenumber::country::Id as CountryId;
use phonenumber::Mode;
use regex::Regex;
use std::sync::OnceLock;

fn cpf_shape() -> &'static Regex {
    static CPF_SHAPE: OnceLock<Regex> = OnceLock::new();
    CPF_SHAPE.get_or_init(|| {
        Regex::new(r"^\d{1,3}\.?\d{3}\.?\d{3}-?\d{2}$").expect("static CPF regex is valid")
    })
}

/// Normalize a CPF to its 11-digit form.
///
/// Accepts masked (`123.456.789-09`) or bare input. Spreadsheets often drop
/// leading zeros, so 9 and 10 digit inputs are left-padded.
pub fn normalize_cpf(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if !cpf_shape().is_match(trimmed) {
        return None;
    }

    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 9 || digits.len() > 11 {
        return None;
    }
    Some(format!("{:0>11}", digits))
}

/// Check both CPF verifier digits. Repeated-digit numbers are rejected.
pub fn is_valid_cpf(cpf: &str) -> bool {
    let digits: Vec<u32> = cpf.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() != 11 || cpf.len() != 11 {
        return false;
    }
    if digits.iter().all(|d| *d == digits[0]) {
        return false;
    }

    let check = |len: usize| -> u32 {
        let sum: u32 = digits[..len]
            .iter()
            .enumerate()
            .map(|(i, d)| d * (len as u32 + 1 - i as u32))
            .sum();
        let rest = (sum * 10) % 11;
        if rest == 10 {
            0
        } else {
            rest
        }
    };

    check(9) == digits[9] && check(10) == digits[10]
}

/// Validate Brazilian phone number and normalize to E.164 format
///
/// Returns (is_valid, normalized_number_or_reason).
pub fn validate_br_phone(raw: &str) -> (bool, String) {
    if raw.trim().is_empty() || raw.len() < 8 {
        return (false, "Phone too short".to_string());
    }

    match phonenumber::parse(Some(CountryId::BR), raw) {
        Ok(number) => {
            if phonenumber::is_valid(&number) {
                let formatted = number.format().mode(Mode::E164).to_string();
                tracing::debug!("Valid BR phone: {} -> {}", raw, formatted);
                (true, formatted)
            } else {
                tracing::debug!("Invalid BR phone number: {}", raw);
                (false, "Invalid Brazilian phone number".to_string())
            }
        }
        Err(e) => {
            tracing::debug!("Failed to parse BR phone '{}': {:?}", raw, e);
            (false, format!("Parse error: {:?}", e))
        }
    }
}

/// Parse a birth date given as `dd/mm/yyyy` or `yyyy-mm-dd`.
pub fn parse_birth_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    NaiveDate::parse_from_str(trimmed, "%d/%m/%Y")
        .or_else(|_| NaiveDate::parse_from_str(trimmed, "%Y-%m-%d"))
        .ok()
}

/// Validate and normalize every row of a submission for `provider`.
///
/// All problems are collected so the user can fix the spreadsheet in one go;
/// rows are reported 1-based.
pub fn validate_records(
    records: &[CpfRecord],
    provider: Provider,
    max_batch_size: usize,
) -> Result<Vec<CpfRecord>, AppError> {
    if records.is_empty() {
        return Err(AppError::BadRequest(
            "Batch must contain at least one CPF".to_string(),
        ));
    }
    if records.len() > max_batch_size {
        return Err(AppError::BadRequest(format!(
            "Batch has {} CPFs, maximum is {}",
            records.len(),
            max_batch_size
        )));
    }

    let mut problems = Vec::new();
    let mut normalized = Vec::with_capacity(records.len());

    for (idx, record) in records.iter().enumerate() {
        let row = idx + 1;
        match validate_record(record, provider) {
            Ok(clean) => normalized.push(clean),
            Err(reason) => problems.push(format!("row {}: {}", row, reason)),
        }
    }

    if !problems.is_empty() {
        let shown: Vec<&str> = problems.iter().take(20).map(String::as_str).collect();
        let more = problems.len().saturating_sub(shown.len());
        let mut message = format!("Invalid rows: {}", shown.join("; "));
        if more > 0 {
            message.push_str(&format!(" (and {} more)", more));
        }
        return Err(AppError::BadRequest(message));
    }

    Ok(normalized)
}

fn validate_record(record: &CpfRecord, provider: Provider) -> Result<CpfRecord, String> {
    let cpf = normalize_cpf(&record.cpf)
        .ok_or_else(|| format!("malformed CPF '{}'", record.cpf.trim()))?;
    if !is_valid_cpf(&cpf) {
        return Err(format!("invalid CPF check digits '{}'", cpf));
    }

    let nome = record
        .nome
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let data_nascimento = match record
        .data_nascimento
        .as_deref()
        .filter(|s| !s.trim().is_empty())
    {
        Some(raw) => Some(
            parse_birth_date(raw)
                .ok_or_else(|| format!("invalid birth date '{}'", raw.trim()))?
                .format("%Y-%m-%d")
                .to_string(),
        ),
        None => None,
    };

    let telefone = match record.telefone.as_deref().filter(|s| !s.trim().is_empty()) {
        Some(raw) => {
            let (valid, normalized) = validate_br_phone(raw);
            if !valid {
                return Err(format!("invalid phone '{}'", raw.trim()));
            }
            Some(normalized)
        }
        None => None,
    };

    match provider {
        Provider::V8 => {}
        Provider::Facta => {
            if data_nascimento.is_none() {
                return Err("facta requires dataNascimento".to_string());
            }
        }
        Provider::C6 => {
            if nome.is_none() || data_nascimento.is_none() || telefone.is_none() {
                return Err("c6 requires nome, dataNascimento and telefone".to_string());
            }
        }
    }

    Ok(CpfRecord {
        cpf,
        nome,
        data_nascimento,
        telefone,
    })
}
