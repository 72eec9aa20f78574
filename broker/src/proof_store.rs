use crate::{
    app_config::{AppBaseConfig, DataStoreKind},
    db::DB,
};
use async_trait::async_trait;
use broker_api::types::{ProofUri, ProvingJobId, ProvingJobInputs, ProvingJobResult};
use chrono::Utc;
use sqlx::PgPool;
use std::sync::Arc;
use thiserror::Error;

const INLINE_PREFIX: &str = "data:application/json;hex,";
const POSTGRES_PREFIX: &str = "postgres://proof_artifacts/";

#[derive(Debug, Error)]
pub enum ProofStoreError {
    #[error("unsupported proof uri {0}")]
    UnsupportedUri(String),
    #[error("no proof artifact at {0}")]
    NotFound(String),
    #[error("malformed inline payload: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("proof payload is not valid json: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Write-once byte storage for proof inputs and outputs. The returned URI is
/// all another process needs to read the payload back.
#[async_trait]
pub trait ProofStore: Send + Sync {
    async fn save(&self, key: &str, payload: &[u8]) -> Result<ProofUri, ProofStoreError>;

    async fn load(&self, uri: &ProofUri) -> Result<Vec<u8>, ProofStoreError>;

    async fn save_proof_input(
        &self,
        id: &ProvingJobId,
        inputs: &ProvingJobInputs,
    ) -> Result<ProofUri, ProofStoreError> {
        let payload = serde_json::to_vec(inputs)?;
        self.save(&format!("{}/inputs", id), &payload).await
    }

    async fn save_proof_output(
        &self,
        id: &ProvingJobId,
        result: &ProvingJobResult,
    ) -> Result<ProofUri, ProofStoreError> {
        let payload = serde_json::to_vec(result)?;
        self.save(&format!("{}/output", id), &payload).await
    }

    async fn get_proof_input(&self, uri: &ProofUri) -> Result<ProvingJobInputs, ProofStoreError> {
        let payload = self.load(uri).await?;
        Ok(serde_json::from_slice(&payload)?)
    }

    async fn get_proof_output(&self, uri: &ProofUri) -> Result<ProvingJobResult, ProofStoreError> {
        let payload = self.load(uri).await?;
        Ok(serde_json::from_slice(&payload)?)
    }
}

/// Keeps the payload inside the URI itself, nothing is stored.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineProofStore;

#[async_trait]
impl ProofStore for InlineProofStore {
    async fn save(&self, _key: &str, payload: &[u8]) -> Result<ProofUri, ProofStoreError> {
        Ok(ProofUri(format!("{}{}", INLINE_PREFIX, hex::encode(payload))))
    }

    async fn load(&self, uri: &ProofUri) -> Result<Vec<u8>, ProofStoreError> {
        let encoded = uri
            .as_str()
            .strip_prefix(INLINE_PREFIX)
            .ok_or_else(|| ProofStoreError::UnsupportedUri(uri.truncated()))?;
        Ok(hex::decode(encoded)?)
    }
}

/// Stores payloads in the `proof_artifacts` table.
#[derive(Clone)]
pub struct PostgresProofStore {
    pool: PgPool,
}

impl PostgresProofStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProofStore for PostgresProofStore {
    async fn save(&self, key: &str, payload: &[u8]) -> Result<ProofUri, ProofStoreError> {
        sqlx::query(
            r#"
            INSERT INTO proof_artifacts (key, payload, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO NOTHING
        "#,
        )
        .bind(key)
        .bind(payload)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(ProofUri(format!("{}{}", POSTGRES_PREFIX, key)))
    }

    async fn load(&self, uri: &ProofUri) -> Result<Vec<u8>, ProofStoreError> {
        let key = uri
            .as_str()
            .strip_prefix(POSTGRES_PREFIX)
            .ok_or_else(|| ProofStoreError::UnsupportedUri(uri.truncated()))?;
        let payload: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT payload FROM proof_artifacts WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        payload.ok_or_else(|| ProofStoreError::NotFound(uri.to_string()))
    }
}

/// Builds the store selected by `--data-store`.
pub async fn create_proof_store(config: &AppBaseConfig) -> anyhow::Result<Arc<dyn ProofStore>> {
    match config.data_store {
        DataStoreKind::Memory => Ok(Arc::new(InlineProofStore)),
        DataStoreKind::Postgres => {
            let db = DB::new(config.db_config()).await?;
            Ok(Arc::new(PostgresProofStore::new(db.pool)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_api::circuits::test_utils::make_base_parity_inputs;

    #[tokio::test]
    async fn inline_store_round_trips_inputs() {
        let store = InlineProofStore;
        let id = ProvingJobId::new("1:BASE_PARITY:aa");
        let inputs = ProvingJobInputs::BaseParity(make_base_parity_inputs(3));
        let uri = store.save_proof_input(&id, &inputs).await.unwrap();
        assert!(uri.as_str().starts_with(INLINE_PREFIX));
        assert_eq!(store.get_proof_input(&uri).await.unwrap(), inputs);
    }

    #[tokio::test]
    async fn inline_store_rejects_foreign_uris() {
        let store = InlineProofStore;
        let err = store
            .load(&ProofUri("postgres://proof_artifacts/x".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, ProofStoreError::UnsupportedUri(_)));

        let err = store
            .load(&ProofUri(format!("{}zz", INLINE_PREFIX)))
            .await
            .unwrap_err();
        assert!(matches!(err, ProofStoreError::Hex(_)));
    }

    #[tokio::test]
    async fn decoding_the_wrong_shape_fails() {
        let store = InlineProofStore;
        let uri = store.save("k", b"{\"not\":\"inputs\"}").await.unwrap();
        assert!(matches!(
            store.get_proof_input(&uri).await,
            Err(ProofStoreError::Encoding(_))
        ));
    }

    #[tokio::test]
    #[ignore = "requires postgres instance"]
    async fn postgres_store_is_write_once() {
        use clap::Parser;
        let cfg = AppBaseConfig::parse_from(["test"]);
        let db = DB::new(cfg.db_config()).await.unwrap();
        let store = PostgresProofStore::new(db.pool);
        let key = format!("test/{}", Utc::now().timestamp_micros());
        let uri = store.save(&key, b"first").await.unwrap();
        let again = store.save(&key, b"second").await.unwrap();
        assert_eq!(uri, again);
        assert_eq!(store.load(&uri).await.unwrap(), b"first".to_vec());
        assert!(matches!(
            store
                .load(&ProofUri(format!("{}missing/{}", POSTGRES_PREFIX, key)))
                .await,
            Err(ProofStoreError::NotFound(_))
        ));
    }
}
