/// Property-based tests using proptest
/// Tests invariants that should hold for all inputs
use chrono::Utc;
use lhamascred_api::models::{BatchJob, BatchStatus, ProgressOutcome, Provider};
use lhamascred_api::validation::{is_valid_cpf, normalize_cpf, validate_br_phone};
use lhamascred_api::webhook_models::{classify, CallbackPayload, Classification};
use proptest::prelude::*;

fn batch_of(total: usize) -> BatchJob {
    BatchJob::new(
        Provider::V8,
        "lote.xlsx".to_string(),
        (0..total).map(|i| format!("{:011}", i)).collect(),
        "user-1".to_string(),
        None,
    )
}

// Property: CPF parsing never panics and keeps only the digits
proptest! {
    #[test]
    fn cpf_normalization_never_panics(raw in "\\PC*") {
        if let Some(cpf) = normalize_cpf(&raw) {
            prop_assert_eq!(cpf.len(), 11);
            prop_assert!(cpf.chars().all(|c| c.is_ascii_digit()));
        }
        let _ = is_valid_cpf(&raw);
    }

    #[test]
    fn formatted_and_bare_cpfs_normalize_alike(digits in "[0-9]{11}") {
        let formatted = format!(
            "{}.{}.{}-{}",
            &digits[..3],
            &digits[3..6],
            &digits[6..9],
            &digits[9..]
        );
        prop_assert_eq!(normalize_cpf(&formatted), Some(digits.clone()));
        prop_assert_eq!(normalize_cpf(&digits), Some(digits));
    }

    #[test]
    fn repeated_digit_cpfs_are_invalid(d in 0u8..=9u8) {
        let cpf = d.to_string().repeat(11);
        prop_assert!(!is_valid_cpf(&cpf));
    }

    #[test]
    fn phone_validation_never_panics(phone in "\\PC*") {
        let _ = validate_br_phone(&phone);
    }
}

// Property: progress counters stay in range and completion happens exactly once
proptest! {
    #[test]
    fn processed_never_exceeds_total(total in 1usize..50, steps in 0usize..120) {
        let mut batch = batch_of(total);
        let mut completions = 0;

        for _ in 0..steps {
            let before = batch.completed_at;
            if let ProgressOutcome::Completed { .. } = batch.apply_progress(Utc::now()) {
                completions += 1;
            }
            prop_assert!(batch.processed_cpfs >= 0);
            prop_assert!(batch.processed_cpfs <= batch.total_cpfs);
            if before.is_some() {
                prop_assert_eq!(batch.completed_at, before);
            }
        }

        if steps >= total {
            prop_assert_eq!(completions, 1);
            prop_assert_eq!(batch.status, BatchStatus::Completed);
            prop_assert_eq!(batch.processed_cpfs as usize, total);
        } else {
            prop_assert_eq!(completions, 0);
            prop_assert!(batch.completed_at.is_none());
        }
    }

    #[test]
    fn expired_batches_never_progress(total in 1usize..20, done in 0usize..20, extra in 1usize..10) {
        let mut batch = batch_of(total);
        for _ in 0..done.min(total - 1) {
            batch.apply_progress(Utc::now());
        }
        prop_assert!(batch.expire("batch expired", Utc::now()));

        let frozen = batch.processed_cpfs;
        for _ in 0..extra {
            prop_assert_eq!(batch.apply_progress(Utc::now()), ProgressOutcome::AlreadyTerminal);
        }
        prop_assert_eq!(batch.processed_cpfs, frozen);
        prop_assert_eq!(batch.status, BatchStatus::Error);
    }
}

// Property: payload handling never panics and always yields a classification
proptest! {
    #[test]
    fn callback_parsing_never_panics(raw in proptest::collection::vec(any::<u8>(), 0..256)) {
        if let Ok(CallbackPayload::Callback { body, .. }) = CallbackPayload::from_bytes(&raw) {
            let _ = classify(&body);
        }
    }

    #[test]
    fn any_error_message_wins_over_balance(reason in "[a-zA-Z][a-zA-Z ]{0,30}", balance in 0u32..100_000) {
        let body = serde_json::json!({
            "balanceId": "b.00001",
            "balance": balance,
            "errorMessage": reason.clone(),
        });
        prop_assert!(matches!(classify(&body), Classification::Error(_)));
    }
}
