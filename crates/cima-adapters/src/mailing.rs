//! Mailing-list upserts keyed by the email address itself.

use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::info;

use crate::{TableClient, UpstreamError};

pub const EMAIL_FIELD: &str = "email";

#[derive(Debug, Error)]
pub enum MailingError {
    #[error("invalid email address {0:?}")]
    InvalidEmail(String),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MailingReceipt {
    pub submitted: usize,
    pub created: usize,
    pub updated: usize,
}

fn normalize_email(raw: &str) -> Result<String, MailingError> {
    let email = raw.trim();
    let valid = email
        .split_once('@')
        .is_some_and(|(local, domain)| !local.is_empty() && !domain.is_empty());
    if valid {
        Ok(email.to_string())
    } else {
        Err(MailingError::InvalidEmail(raw.to_string()))
    }
}

/// Upsert each address as a row keyed by `email`. Duplicates collapse to one row, and the
/// whole batch is validated before anything is sent upstream.
pub async fn upsert_mailing(
    client: &dyn TableClient,
    table: &str,
    emails: &[String],
) -> Result<MailingReceipt, MailingError> {
    let mut unique: Vec<String> = Vec::with_capacity(emails.len());
    for raw in emails {
        let email = normalize_email(raw)?;
        if !unique.contains(&email) {
            unique.push(email);
        }
    }
    if unique.is_empty() {
        return Ok(MailingReceipt::default());
    }

    let rows = unique
        .iter()
        .map(|email| {
            let mut fields = Map::new();
            fields.insert(EMAIL_FIELD.to_string(), JsonValue::String(email.clone()));
            fields
        })
        .collect::<Vec<_>>();

    let summary = client.upsert_records(table, &[EMAIL_FIELD], rows).await?;
    let receipt = MailingReceipt {
        submitted: unique.len(),
        created: summary.created.len(),
        updated: summary.updated.len(),
    };
    info!(
        table,
        submitted = receipt.submitted,
        created = receipt.created,
        updated = receipt.updated,
        "upserted mailing list entries"
    );
    Ok(receipt)
}
