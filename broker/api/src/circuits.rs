use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt::{self, Display};

/// A field element, carried around as its 32 byte big-endian encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Fr(pub [u8; 32]);

impl Fr {
    pub const ZERO: Fr = Fr([0u8; 32]);

    pub fn from_u64(v: u64) -> Self {
        let mut bytes = [0u8; 32];
        bytes[24..].copy_from_slice(&v.to_be_bytes());
        Fr(bytes)
    }

    /// Hashes the given chunks with sha256 and truncates into the field by
    /// clearing the top byte.
    pub fn hash_of<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        let mut hasher = Sha256::new();
        for chunk in chunks {
            hasher.update(chunk.as_ref());
        }
        let mut bytes: [u8; 32] = hasher.finalize().into();
        bytes[0] = 0;
        Fr(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Display for Fr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl Serialize for Fr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Fr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let digits = s.strip_prefix("0x").unwrap_or(&s);
        let bytes = hex::decode(digits).map_err(de::Error::custom)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| de::Error::invalid_length(b.len(), &"32 bytes"))?;
        Ok(Fr(bytes))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationKeyData {
    pub key_as_fields: Vec<Fr>,
    pub hash: Fr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofAndVerificationKey {
    pub proof: Vec<Fr>,
    pub verification_key: VerificationKeyData,
}

/// Public inputs of a circuit together with the recursive proof attesting to them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicInputsAndRecursiveProof<T> {
    pub inputs: T,
    pub proof: Vec<Fr>,
    pub verification_key: VerificationKeyData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParityPublicInputs {
    pub sha_root: Fr,
    pub converted_root: Fr,
    pub vk_tree_root: Fr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseOrMergeRollupPublicInputs {
    pub num_txs: u32,
    pub start_state_root: Fr,
    pub end_state_root: Fr,
    pub out_hash: Fr,
    pub accumulated_fees: Fr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRootOrBlockMergePublicInputs {
    pub previous_archive_root: Fr,
    pub new_archive_root: Fr,
    pub start_block_number: u64,
    pub end_block_number: u64,
    pub out_hash: Fr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootRollupPublicInputs {
    pub previous_archive_root: Fr,
    pub end_archive_root: Fr,
    pub out_hash: Fr,
    pub prover_id: Fr,
}

pub type ParityProof = PublicInputsAndRecursiveProof<ParityPublicInputs>;
pub type BaseOrMergeRollupProof = PublicInputsAndRecursiveProof<BaseOrMergeRollupPublicInputs>;
pub type BlockRootOrBlockMergeProof =
    PublicInputsAndRecursiveProof<BlockRootOrBlockMergePublicInputs>;
pub type RootRollupProof = PublicInputsAndRecursiveProof<RootRollupPublicInputs>;

// Circuit inputs

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvmCircuitInputs {
    pub function_name: String,
    pub calldata: Vec<Fr>,
    pub hints: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseParityInputs {
    pub msgs: Vec<Fr>,
    pub vk_tree_root: Fr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootParityInputs {
    pub children: Vec<ParityProof>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TubeInputs {
    pub client_ivc_proof: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateBaseRollupInputs {
    pub tube_data: ProofAndVerificationKey,
    pub hints: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicBaseRollupInputs {
    pub tube_data: ProofAndVerificationKey,
    pub avm_proof_data: ProofAndVerificationKey,
    pub hints: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRollupInputs {
    pub previous_rollups: [BaseOrMergeRollupProof; 2],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRootRollupInputs {
    pub previous_rollups: [BaseOrMergeRollupProof; 2],
    pub l1_to_l2_roots: ParityProof,
    pub new_archive_sibling_path: Vec<Fr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleTxBlockRootRollupInputs {
    pub previous_rollup: BaseOrMergeRollupProof,
    pub l1_to_l2_roots: ParityProof,
    pub new_archive_sibling_path: Vec<Fr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyBlockRootRollupInputs {
    pub l1_to_l2_roots: ParityProof,
    pub previous_archive_root: Fr,
    pub block_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMergeRollupInputs {
    pub previous_rollups: [BlockRootOrBlockMergeProof; 2],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootRollupInputs {
    pub previous_rollups: [BlockRootOrBlockMergeProof; 2],
    pub prover_id: Fr,
}

#[cfg(any(test, feature = "test"))]
pub mod test_utils {
    use super::*;
    use proptest::prelude::*;

    impl Arbitrary for Fr {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
            any::<[u8; 32]>()
                .prop_map(|mut bytes| {
                    bytes[0] = 0;
                    Fr(bytes)
                })
                .boxed()
        }
    }

    impl Arbitrary for BaseParityInputs {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
            (prop::collection::vec(any::<Fr>(), 1..=16), any::<Fr>())
                .prop_map(|(msgs, vk_tree_root)| BaseParityInputs { msgs, vk_tree_root })
                .boxed()
        }
    }

    pub fn make_base_parity_inputs(seed: u64) -> BaseParityInputs {
        BaseParityInputs {
            msgs: (0..4).map(|i| Fr::from_u64(seed * 16 + i)).collect(),
            vk_tree_root: Fr::from_u64(42),
        }
    }
}
