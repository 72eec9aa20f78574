use crate::circuits::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    fmt::{self, Display},
    str::FromStr,
};
use thiserror::Error;

/// Identifies one broker submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProvingJobId(pub String);

impl ProvingJobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ProvingJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to a payload held by a proof store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProofUri(pub String);

impl ProofUri {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shortened form for log lines, inline URIs can be very long.
    pub fn truncated(&self) -> String {
        const MAX: usize = 64;
        match self.0.char_indices().nth(MAX) {
            Some((idx, _)) => format!("{}...", &self.0[..idx]),
            None => self.0.clone(),
        }
    }
}

impl Display for ProofUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProvingRequestType {
    PublicVm,
    BaseParity,
    RootParity,
    PrivateBaseRollup,
    PublicBaseRollup,
    MergeRollup,
    BlockRootRollup,
    SingleTxBlockRootRollup,
    EmptyBlockRootRollup,
    BlockMergeRollup,
    RootRollup,
    TubeProof,
}

/// Order in which an agent accepting several types is handed work. Jobs closer
/// to the root of the rollup tree unblock the most downstream work.
pub const PROOF_TYPES_IN_PRIORITY_ORDER: [ProvingRequestType; 12] = [
    ProvingRequestType::BlockRootRollup,
    ProvingRequestType::SingleTxBlockRootRollup,
    ProvingRequestType::BlockMergeRollup,
    ProvingRequestType::RootRollup,
    ProvingRequestType::MergeRollup,
    ProvingRequestType::PublicBaseRollup,
    ProvingRequestType::PrivateBaseRollup,
    ProvingRequestType::PublicVm,
    ProvingRequestType::TubeProof,
    ProvingRequestType::RootParity,
    ProvingRequestType::BaseParity,
    ProvingRequestType::EmptyBlockRootRollup,
];

impl ProvingRequestType {
    pub const ALL: [ProvingRequestType; 12] = [
        ProvingRequestType::PublicVm,
        ProvingRequestType::BaseParity,
        ProvingRequestType::RootParity,
        ProvingRequestType::PrivateBaseRollup,
        ProvingRequestType::PublicBaseRollup,
        ProvingRequestType::MergeRollup,
        ProvingRequestType::BlockRootRollup,
        ProvingRequestType::SingleTxBlockRootRollup,
        ProvingRequestType::EmptyBlockRootRollup,
        ProvingRequestType::BlockMergeRollup,
        ProvingRequestType::RootRollup,
        ProvingRequestType::TubeProof,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProvingRequestType::PublicVm => "PUBLIC_VM",
            ProvingRequestType::BaseParity => "BASE_PARITY",
            ProvingRequestType::RootParity => "ROOT_PARITY",
            ProvingRequestType::PrivateBaseRollup => "PRIVATE_BASE_ROLLUP",
            ProvingRequestType::PublicBaseRollup => "PUBLIC_BASE_ROLLUP",
            ProvingRequestType::MergeRollup => "MERGE_ROLLUP",
            ProvingRequestType::BlockRootRollup => "BLOCK_ROOT_ROLLUP",
            ProvingRequestType::SingleTxBlockRootRollup => "SINGLE_TX_BLOCK_ROOT_ROLLUP",
            ProvingRequestType::EmptyBlockRootRollup => "EMPTY_BLOCK_ROOT_ROLLUP",
            ProvingRequestType::BlockMergeRollup => "BLOCK_MERGE_ROLLUP",
            ProvingRequestType::RootRollup => "ROOT_ROLLUP",
            ProvingRequestType::TubeProof => "TUBE_PROOF",
        }
    }
}

impl Display for ProvingRequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown proving request type {0}")]
pub struct UnknownRequestType(pub String);

impl FromStr for ProvingRequestType {
    type Err = UnknownRequestType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProvingRequestType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownRequestType(s.to_string()))
    }
}

/// A unit of work as the broker sees it. The inputs live in a proof store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvingJob {
    pub id: ProvingJobId,
    #[serde(rename = "type")]
    pub request_type: ProvingRequestType,
    pub inputs_uri: ProofUri,
    pub epoch_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum ProvingJobStatus {
    NotFound,
    InQueue,
    InProgress,
    Fulfilled { value: ProofUri },
    Rejected { reason: String },
}

impl ProvingJobStatus {
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            ProvingJobStatus::Fulfilled { .. } | ProvingJobStatus::Rejected { .. }
        )
    }

    pub fn settled(&self) -> Option<ProvingJobSettledResult> {
        match self {
            ProvingJobStatus::Fulfilled { value } => Some(ProvingJobSettledResult::Fulfilled {
                value: value.clone(),
            }),
            ProvingJobStatus::Rejected { reason } => Some(ProvingJobSettledResult::Rejected {
                reason: reason.clone(),
            }),
            _ => None,
        }
    }
}

/// The terminal outcome of a job, also what an agent reports back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum ProvingJobSettledResult {
    Fulfilled { value: ProofUri },
    Rejected { reason: String },
}

impl From<ProvingJobSettledResult> for ProvingJobStatus {
    fn from(result: ProvingJobSettledResult) -> Self {
        match result {
            ProvingJobSettledResult::Fulfilled { value } => ProvingJobStatus::Fulfilled { value },
            ProvingJobSettledResult::Rejected { reason } => ProvingJobStatus::Rejected { reason },
        }
    }
}

/// A job handed to an agent. `time` is the broker's claim time in unix
/// milliseconds; the agent echoes it back with every heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvingJobAssignment {
    pub job: ProvingJob,
    pub time: u64,
}

/// Broker answer to an agent heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum JobProgressResponse {
    KeepWorking,
    Abort {
        next_job: Option<ProvingJobAssignment>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "inputs", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProvingJobInputs {
    PublicVm(AvmCircuitInputs),
    BaseParity(BaseParityInputs),
    RootParity(RootParityInputs),
    PrivateBaseRollup(PrivateBaseRollupInputs),
    PublicBaseRollup(PublicBaseRollupInputs),
    MergeRollup(MergeRollupInputs),
    BlockRootRollup(BlockRootRollupInputs),
    SingleTxBlockRootRollup(SingleTxBlockRootRollupInputs),
    EmptyBlockRootRollup(EmptyBlockRootRollupInputs),
    BlockMergeRollup(BlockMergeRollupInputs),
    RootRollup(RootRollupInputs),
    TubeProof(TubeInputs),
}

impl ProvingJobInputs {
    pub fn request_type(&self) -> ProvingRequestType {
        match self {
            ProvingJobInputs::PublicVm(_) => ProvingRequestType::PublicVm,
            ProvingJobInputs::BaseParity(_) => ProvingRequestType::BaseParity,
            ProvingJobInputs::RootParity(_) => ProvingRequestType::RootParity,
            ProvingJobInputs::PrivateBaseRollup(_) => ProvingRequestType::PrivateBaseRollup,
            ProvingJobInputs::PublicBaseRollup(_) => ProvingRequestType::PublicBaseRollup,
            ProvingJobInputs::MergeRollup(_) => ProvingRequestType::MergeRollup,
            ProvingJobInputs::BlockRootRollup(_) => ProvingRequestType::BlockRootRollup,
            ProvingJobInputs::SingleTxBlockRootRollup(_) => {
                ProvingRequestType::SingleTxBlockRootRollup
            }
            ProvingJobInputs::EmptyBlockRootRollup(_) => ProvingRequestType::EmptyBlockRootRollup,
            ProvingJobInputs::BlockMergeRollup(_) => ProvingRequestType::BlockMergeRollup,
            ProvingJobInputs::RootRollup(_) => ProvingRequestType::RootRollup,
            ProvingJobInputs::TubeProof(_) => ProvingRequestType::TubeProof,
        }
    }

    /// sha256 over the canonical JSON encoding, hex encoded.
    pub fn fingerprint(&self) -> Result<String, serde_json::Error> {
        let bytes = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "result", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProvingJobResult {
    PublicVm(ProofAndVerificationKey),
    BaseParity(ParityProof),
    RootParity(ParityProof),
    PrivateBaseRollup(BaseOrMergeRollupProof),
    PublicBaseRollup(BaseOrMergeRollupProof),
    MergeRollup(BaseOrMergeRollupProof),
    BlockRootRollup(BlockRootOrBlockMergeProof),
    SingleTxBlockRootRollup(BlockRootOrBlockMergeProof),
    EmptyBlockRootRollup(BlockRootOrBlockMergeProof),
    BlockMergeRollup(BlockRootOrBlockMergeProof),
    RootRollup(RootRollupProof),
    TubeProof(ProofAndVerificationKey),
}

impl ProvingJobResult {
    pub fn request_type(&self) -> ProvingRequestType {
        match self {
            ProvingJobResult::PublicVm(_) => ProvingRequestType::PublicVm,
            ProvingJobResult::BaseParity(_) => ProvingRequestType::BaseParity,
            ProvingJobResult::RootParity(_) => ProvingRequestType::RootParity,
            ProvingJobResult::PrivateBaseRollup(_) => ProvingRequestType::PrivateBaseRollup,
            ProvingJobResult::PublicBaseRollup(_) => ProvingRequestType::PublicBaseRollup,
            ProvingJobResult::MergeRollup(_) => ProvingRequestType::MergeRollup,
            ProvingJobResult::BlockRootRollup(_) => ProvingRequestType::BlockRootRollup,
            ProvingJobResult::SingleTxBlockRootRollup(_) => {
                ProvingRequestType::SingleTxBlockRootRollup
            }
            ProvingJobResult::EmptyBlockRootRollup(_) => ProvingRequestType::EmptyBlockRootRollup,
            ProvingJobResult::BlockMergeRollup(_) => ProvingRequestType::BlockMergeRollup,
            ProvingJobResult::RootRollup(_) => ProvingRequestType::RootRollup,
            ProvingJobResult::TubeProof(_) => ProvingRequestType::TubeProof,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobIdError {
    #[error("job id {0} is not of the form epoch:type:hash")]
    Malformed(String),
    #[error("job id has an invalid epoch: {0}")]
    InvalidEpoch(String),
    #[error(transparent)]
    UnknownType(#[from] UnknownRequestType),
}

/// Builds the deterministic id the facade uses as a job's fingerprint.
pub fn make_proving_job_id(
    epoch_number: u64,
    request_type: ProvingRequestType,
    inputs_hash: &str,
) -> ProvingJobId {
    ProvingJobId(format!("{}:{}:{}", epoch_number, request_type, inputs_hash))
}

pub fn parse_proving_job_id(
    id: &ProvingJobId,
) -> Result<(u64, ProvingRequestType, String), JobIdError> {
    let mut parts = id.0.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(epoch), Some(request_type), Some(hash)) => {
            let epoch = epoch
                .parse()
                .map_err(|_| JobIdError::InvalidEpoch(epoch.to_string()))?;
            let request_type = request_type.parse()?;
            Ok((epoch, request_type, hash.to_string()))
        }
        _ => Err(JobIdError::Malformed(id.0.clone())),
    }
}
