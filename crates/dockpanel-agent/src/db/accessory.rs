use rusqlite::params;
use serde::Deserialize;

use super::{Db, Filter, create, delete, get_first, list};
use crate::{
    error::PanelError,
    model::{AcmeAccount, BackupAccount, Setting, Snapshot},
};

/// ACME providers that need external account binding.
const EAB_PROVIDERS: &[&str] = &["google", "freessl"];

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AcmeAccountInput {
    pub email: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub eab_kid: String,
    pub eab_hmac_key: String,
    pub ca_dir_url: String,
}

impl Db {
    /// Stores an ACME account. Registration with the CA happens elsewhere.
    pub async fn create_acme_account(&self, input: AcmeAccountInput) -> anyhow::Result<AcmeAccount> {
        self.tx(move |tx| {
            let exist = get_first::<AcmeAccount>(
                tx,
                &[
                    Filter::Eq("email", input.email.clone().into()),
                    Filter::Type(input.kind.clone()),
                ],
            )?;
            if exist.is_some() {
                return Err(PanelError::EmailIsExist.into());
            }

            let mut account = AcmeAccount {
                email: input.email,
                kind: input.kind,
                ..Default::default()
            };
            if EAB_PROVIDERS.contains(&account.kind.as_str()) {
                if input.eab_kid.is_empty() || input.eab_hmac_key.is_empty() {
                    return Err(PanelError::EabKidOrEabHmacKeyCannotBlank.into());
                }
                account.eab_kid = input.eab_kid;
                account.eab_hmac_key = input.eab_hmac_key;
            }
            if account.kind == "custom" && !input.ca_dir_url.is_empty() {
                account.url = input.ca_dir_url;
            }
            create(tx, &mut account)?;
            Ok(account)
        })
        .await
    }

    /// Deletes a backup account unless it is the built-in local one or a snapshot still
    /// references it.
    pub async fn delete_backup_account(&self, id: i64) -> anyhow::Result<()> {
        self.tx(move |tx| {
            let account = get_first::<BackupAccount>(tx, &[Filter::Id(id)])?
                .ok_or(PanelError::RecordNotFound)?;
            if account.kind.eq_ignore_ascii_case("local") {
                return Err(PanelError::AccountCannotDelete.into());
            }
            let snapshots = list::<Snapshot>(tx, &[])?;
            let in_use = snapshots.iter().any(|s| {
                s.download_account_id == id || csv_contains(&s.source_account_ids, id)
            });
            if in_use {
                return Err(PanelError::AccountCannotDelete.into());
            }
            delete::<BackupAccount>(tx, &[Filter::Id(id)])?;
            Ok(())
        })
        .await
    }

    pub async fn get_setting(&self, key: &str) -> anyhow::Result<Option<String>> {
        let row: Option<Setting> = self.first(vec![Filter::Key(key.to_string())]).await?;
        Ok(row.map(|s| s.value))
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let (key, value) = (key.to_string(), value.to_string());
        self.call(move |conn| {
            conn.execute(
                r#"INSERT INTO settings ("key", value) VALUES (?1, ?2)
ON CONFLICT("key") DO UPDATE SET value = excluded.value"#,
                params![key, value],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn log_operation(&self, source: &str, action: &str, detail: &str) -> anyhow::Result<()> {
        let (source, action, detail) = (source.to_string(), action.to_string(), detail.to_string());
        let now = crate::ids::now_rfc3339()?;
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO operation_logs (source, action, detail, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![source, action, detail, now],
            )?;
            Ok(())
        })
        .await
    }
}

/// `true` when the comma-separated id list `csv` contains `id`.
pub fn csv_contains(csv: &str, id: i64) -> bool {
    csv.split(',')
        .filter_map(|s| s.trim().parse::<i64>().ok())
        .any(|v| v == id)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::error::panel_error;

    #[tokio::test]
    async fn acme_account_rules() {
        let db = Db::open(Path::new(":memory:")).await.unwrap();
        let input = AcmeAccountInput {
            email: "ops@example.com".to_string(),
            kind: "letsencrypt".to_string(),
            ..Default::default()
        };
        db.create_acme_account(input.clone()).await.unwrap();

        let err = db.create_acme_account(input).await.unwrap_err();
        assert!(matches!(panel_error(&err), Some(PanelError::EmailIsExist)));

        let err = db
            .create_acme_account(AcmeAccountInput {
                email: "ops@example.com".to_string(),
                kind: "google".to_string(),
                eab_kid: "kid".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(
            panel_error(&err),
            Some(PanelError::EabKidOrEabHmacKeyCannotBlank)
        ));
    }

    #[tokio::test]
    async fn referenced_backup_account_is_kept() {
        let db = Db::open(Path::new(":memory:")).await.unwrap();
        let account = db
            .create(BackupAccount {
                name: "dav".to_string(),
                kind: "WebDAV".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        db.create(Snapshot {
            name: "s1".to_string(),
            status: "success".to_string(),
            source_account_ids: format!("1,{}", account.id),
            created_at: "2024-01-01T00:00:00Z".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

        let err = db.delete_backup_account(account.id).await.unwrap_err();
        assert!(matches!(panel_error(&err), Some(PanelError::AccountCannotDelete)));

        db.delete::<Snapshot>(vec![Filter::Name("s1".to_string())])
            .await
            .unwrap();
        db.delete_backup_account(account.id).await.unwrap();
    }

    #[tokio::test]
    async fn settings_upsert() {
        let db = Db::open(Path::new(":memory:")).await.unwrap();
        assert_eq!(db.get_setting("SystemVersion").await.unwrap(), None);
        db.set_setting("SystemVersion", "v2.0.0").await.unwrap();
        db.set_setting("SystemVersion", "v2.0.1").await.unwrap();
        assert_eq!(
            db.get_setting("SystemVersion").await.unwrap().as_deref(),
            Some("v2.0.1")
        );
    }

    #[test]
    fn csv_ids() {
        assert!(csv_contains("1, 2,3", 2));
        assert!(!csv_contains("12", 1));
    }
}
