use async_trait::async_trait;
use broker_api::{circuits::*, types::ProvingRequestType};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, instrument};

/// Generates proofs for every circuit the broker schedules.
#[async_trait]
pub trait ServerCircuitProver: Send + Sync {
    async fn get_avm_proof(
        &self,
        inputs: AvmCircuitInputs,
    ) -> anyhow::Result<ProofAndVerificationKey>;

    async fn get_base_parity_proof(&self, inputs: BaseParityInputs)
        -> anyhow::Result<ParityProof>;

    async fn get_root_parity_proof(&self, inputs: RootParityInputs)
        -> anyhow::Result<ParityProof>;

    async fn get_private_base_rollup_proof(
        &self,
        inputs: PrivateBaseRollupInputs,
    ) -> anyhow::Result<BaseOrMergeRollupProof>;

    async fn get_public_base_rollup_proof(
        &self,
        inputs: PublicBaseRollupInputs,
    ) -> anyhow::Result<BaseOrMergeRollupProof>;

    async fn get_merge_rollup_proof(
        &self,
        inputs: MergeRollupInputs,
    ) -> anyhow::Result<BaseOrMergeRollupProof>;

    async fn get_block_root_rollup_proof(
        &self,
        inputs: BlockRootRollupInputs,
    ) -> anyhow::Result<BlockRootOrBlockMergeProof>;

    async fn get_single_tx_block_root_rollup_proof(
        &self,
        inputs: SingleTxBlockRootRollupInputs,
    ) -> anyhow::Result<BlockRootOrBlockMergeProof>;

    async fn get_empty_block_root_rollup_proof(
        &self,
        inputs: EmptyBlockRootRollupInputs,
    ) -> anyhow::Result<BlockRootOrBlockMergeProof>;

    async fn get_block_merge_rollup_proof(
        &self,
        inputs: BlockMergeRollupInputs,
    ) -> anyhow::Result<BlockRootOrBlockMergeProof>;

    async fn get_root_rollup_proof(
        &self,
        inputs: RootRollupInputs,
    ) -> anyhow::Result<RootRollupProof>;

    async fn get_tube_proof(&self, inputs: TubeInputs) -> anyhow::Result<ProofAndVerificationKey>;
}

const PROOF_LENGTH: u64 = 4;
const VK_LENGTH: u64 = 2;

fn fields_bytes(fields: &[Fr]) -> Vec<u8> {
    fields.iter().flat_map(|f| f.0).collect()
}

fn simulated_proof(request_type: ProvingRequestType, seed: &Fr) -> Vec<Fr> {
    (0..PROOF_LENGTH)
        .map(|i| {
            Fr::hash_of([
                request_type.as_str().as_bytes(),
                seed.as_bytes().as_slice(),
                i.to_be_bytes().as_slice(),
            ])
        })
        .collect()
}

fn simulated_vk(request_type: ProvingRequestType) -> VerificationKeyData {
    let tag = request_type.as_str().as_bytes();
    VerificationKeyData {
        key_as_fields: (0..VK_LENGTH)
            .map(|i| Fr::hash_of([tag, b"vk".as_slice(), i.to_be_bytes().as_slice()]))
            .collect(),
        hash: Fr::hash_of([tag, b"vk".as_slice()]),
    }
}

fn recursive<T>(
    request_type: ProvingRequestType,
    inputs: T,
    seed: &Fr,
) -> PublicInputsAndRecursiveProof<T> {
    PublicInputsAndRecursiveProof {
        inputs,
        proof: simulated_proof(request_type, seed),
        verification_key: simulated_vk(request_type),
    }
}

fn proof_and_vk(request_type: ProvingRequestType, seed: &Fr) -> ProofAndVerificationKey {
    ProofAndVerificationKey {
        proof: simulated_proof(request_type, seed),
        verification_key: simulated_vk(request_type),
    }
}

fn base_rollup(
    request_type: ProvingRequestType,
    tube_data: &ProofAndVerificationKey,
    extra: &[u8],
    hints: &[u8],
) -> BaseOrMergeRollupProof {
    let tube = fields_bytes(&tube_data.proof);
    let public_inputs = BaseOrMergeRollupPublicInputs {
        num_txs: 1,
        start_state_root: Fr::hash_of([b"start".as_slice(), hints]),
        end_state_root: Fr::hash_of([b"end".as_slice(), tube.as_slice(), extra, hints]),
        out_hash: Fr::hash_of([b"out".as_slice(), tube.as_slice(), extra]),
        accumulated_fees: Fr::from_u64(hints.len() as u64),
    };
    let seed = public_inputs.end_state_root;
    recursive(request_type, public_inputs, &seed)
}

fn block_root(
    request_type: ProvingRequestType,
    start: &BaseOrMergeRollupPublicInputs,
    end: &BaseOrMergeRollupPublicInputs,
    l1_to_l2_roots: &ParityProof,
    new_archive_sibling_path: &[Fr],
) -> BlockRootOrBlockMergeProof {
    let previous_archive_root = Fr::hash_of([fields_bytes(new_archive_sibling_path)]);
    let public_inputs = BlockRootOrBlockMergePublicInputs {
        previous_archive_root,
        new_archive_root: Fr::hash_of([
            previous_archive_root.as_bytes(),
            start.start_state_root.as_bytes(),
            end.end_state_root.as_bytes(),
            l1_to_l2_roots.inputs.converted_root.as_bytes(),
        ]),
        start_block_number: 0,
        end_block_number: 0,
        out_hash: Fr::hash_of([start.out_hash.as_bytes(), end.out_hash.as_bytes()]),
    };
    let seed = public_inputs.new_archive_root;
    recursive(request_type, public_inputs, &seed)
}

/// Produces structurally valid, deterministic proofs without doing any real
/// proving. Equal inputs always give equal outputs.
#[derive(Clone, Default)]
pub struct SimulatedProver {
    delay: Duration,
    failures: HashMap<ProvingRequestType, String>,
    proofs_generated: Arc<AtomicUsize>,
}

impl SimulatedProver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every proof takes at least `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Proofs of `request_type` fail with `reason`.
    pub fn with_failure(mut self, request_type: ProvingRequestType, reason: &str) -> Self {
        self.failures.insert(request_type, reason.to_string());
        self
    }

    /// Number of proving calls that ran to completion, failures included.
    pub fn proofs_generated(&self) -> usize {
        self.proofs_generated.load(Ordering::SeqCst)
    }

    async fn simulate(&self, request_type: ProvingRequestType) -> anyhow::Result<()> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.proofs_generated.fetch_add(1, Ordering::SeqCst);
        debug!("Simulated {} proof", request_type);
        match self.failures.get(&request_type) {
            Some(reason) => Err(anyhow::anyhow!("{}", reason)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ServerCircuitProver for SimulatedProver {
    #[instrument(skip_all)]
    async fn get_avm_proof(
        &self,
        inputs: AvmCircuitInputs,
    ) -> anyhow::Result<ProofAndVerificationKey> {
        self.simulate(ProvingRequestType::PublicVm).await?;
        let seed = Fr::hash_of([
            inputs.function_name.as_bytes(),
            fields_bytes(&inputs.calldata).as_slice(),
            inputs.hints.as_slice(),
        ]);
        Ok(proof_and_vk(ProvingRequestType::PublicVm, &seed))
    }

    #[instrument(skip_all)]
    async fn get_base_parity_proof(
        &self,
        inputs: BaseParityInputs,
    ) -> anyhow::Result<ParityProof> {
        self.simulate(ProvingRequestType::BaseParity).await?;
        let msgs = fields_bytes(&inputs.msgs);
        let public_inputs = ParityPublicInputs {
            sha_root: Fr::hash_of([&msgs]),
            converted_root: Fr::hash_of([b"converted".as_slice(), msgs.as_slice()]),
            vk_tree_root: inputs.vk_tree_root,
        };
        let seed = public_inputs.sha_root;
        Ok(recursive(ProvingRequestType::BaseParity, public_inputs, &seed))
    }

    #[instrument(skip_all)]
    async fn get_root_parity_proof(
        &self,
        inputs: RootParityInputs,
    ) -> anyhow::Result<ParityProof> {
        self.simulate(ProvingRequestType::RootParity).await?;
        let public_inputs = ParityPublicInputs {
            sha_root: Fr::hash_of(inputs.children.iter().map(|c| c.inputs.sha_root.0)),
            converted_root: Fr::hash_of(
                inputs.children.iter().map(|c| c.inputs.converted_root.0),
            ),
            vk_tree_root: inputs
                .children
                .first()
                .map(|c| c.inputs.vk_tree_root)
                .unwrap_or(Fr::ZERO),
        };
        let seed = public_inputs.sha_root;
        Ok(recursive(ProvingRequestType::RootParity, public_inputs, &seed))
    }

    #[instrument(skip_all)]
    async fn get_private_base_rollup_proof(
        &self,
        inputs: PrivateBaseRollupInputs,
    ) -> anyhow::Result<BaseOrMergeRollupProof> {
        self.simulate(ProvingRequestType::PrivateBaseRollup).await?;
        Ok(base_rollup(
            ProvingRequestType::PrivateBaseRollup,
            &inputs.tube_data,
            &[],
            &inputs.hints,
        ))
    }

    #[instrument(skip_all)]
    async fn get_public_base_rollup_proof(
        &self,
        inputs: PublicBaseRollupInputs,
    ) -> anyhow::Result<BaseOrMergeRollupProof> {
        self.simulate(ProvingRequestType::PublicBaseRollup).await?;
        Ok(base_rollup(
            ProvingRequestType::PublicBaseRollup,
            &inputs.tube_data,
            &fields_bytes(&inputs.avm_proof_data.proof),
            &inputs.hints,
        ))
    }

    #[instrument(skip_all)]
    async fn get_merge_rollup_proof(
        &self,
        inputs: MergeRollupInputs,
    ) -> anyhow::Result<BaseOrMergeRollupProof> {
        self.simulate(ProvingRequestType::MergeRollup).await?;
        let [left, right] = &inputs.previous_rollups;
        let public_inputs = BaseOrMergeRollupPublicInputs {
            num_txs: left.inputs.num_txs + right.inputs.num_txs,
            start_state_root: left.inputs.start_state_root,
            end_state_root: right.inputs.end_state_root,
            out_hash: Fr::hash_of([left.inputs.out_hash.0, right.inputs.out_hash.0]),
            accumulated_fees: Fr::hash_of([
                left.inputs.accumulated_fees.0,
                right.inputs.accumulated_fees.0,
            ]),
        };
        let seed = public_inputs.out_hash;
        Ok(recursive(ProvingRequestType::MergeRollup, public_inputs, &seed))
    }

    #[instrument(skip_all)]
    async fn get_block_root_rollup_proof(
        &self,
        inputs: BlockRootRollupInputs,
    ) -> anyhow::Result<BlockRootOrBlockMergeProof> {
        self.simulate(ProvingRequestType::BlockRootRollup).await?;
        let [left, right] = &inputs.previous_rollups;
        Ok(block_root(
            ProvingRequestType::BlockRootRollup,
            &left.inputs,
            &right.inputs,
            &inputs.l1_to_l2_roots,
            &inputs.new_archive_sibling_path,
        ))
    }

    #[instrument(skip_all)]
    async fn get_single_tx_block_root_rollup_proof(
        &self,
        inputs: SingleTxBlockRootRollupInputs,
    ) -> anyhow::Result<BlockRootOrBlockMergeProof> {
        self.simulate(ProvingRequestType::SingleTxBlockRootRollup)
            .await?;
        Ok(block_root(
            ProvingRequestType::SingleTxBlockRootRollup,
            &inputs.previous_rollup.inputs,
            &inputs.previous_rollup.inputs,
            &inputs.l1_to_l2_roots,
            &inputs.new_archive_sibling_path,
        ))
    }

    #[instrument(skip_all)]
    async fn get_empty_block_root_rollup_proof(
        &self,
        inputs: EmptyBlockRootRollupInputs,
    ) -> anyhow::Result<BlockRootOrBlockMergeProof> {
        self.simulate(ProvingRequestType::EmptyBlockRootRollup)
            .await?;
        let public_inputs = BlockRootOrBlockMergePublicInputs {
            previous_archive_root: inputs.previous_archive_root,
            new_archive_root: Fr::hash_of([
                inputs.previous_archive_root.as_bytes().as_slice(),
                inputs.l1_to_l2_roots.inputs.converted_root.as_bytes().as_slice(),
                inputs.block_number.to_be_bytes().as_slice(),
            ]),
            start_block_number: inputs.block_number,
            end_block_number: inputs.block_number,
            out_hash: Fr::ZERO,
        };
        let seed = public_inputs.new_archive_root;
        Ok(recursive(
            ProvingRequestType::EmptyBlockRootRollup,
            public_inputs,
            &seed,
        ))
    }

    #[instrument(skip_all)]
    async fn get_block_merge_rollup_proof(
        &self,
        inputs: BlockMergeRollupInputs,
    ) -> anyhow::Result<BlockRootOrBlockMergeProof> {
        self.simulate(ProvingRequestType::BlockMergeRollup).await?;
        let [left, right] = &inputs.previous_rollups;
        let public_inputs = BlockRootOrBlockMergePublicInputs {
            previous_archive_root: left.inputs.previous_archive_root,
            new_archive_root: right.inputs.new_archive_root,
            start_block_number: left.inputs.start_block_number,
            end_block_number: right.inputs.end_block_number,
            out_hash: Fr::hash_of([left.inputs.out_hash.0, right.inputs.out_hash.0]),
        };
        let seed = public_inputs.new_archive_root;
        Ok(recursive(
            ProvingRequestType::BlockMergeRollup,
            public_inputs,
            &seed,
        ))
    }

    #[instrument(skip_all)]
    async fn get_root_rollup_proof(
        &self,
        inputs: RootRollupInputs,
    ) -> anyhow::Result<RootRollupProof> {
        self.simulate(ProvingRequestType::RootRollup).await?;
        let [left, right] = &inputs.previous_rollups;
        let public_inputs = RootRollupPublicInputs {
            previous_archive_root: left.inputs.previous_archive_root,
            end_archive_root: right.inputs.new_archive_root,
            out_hash: Fr::hash_of([left.inputs.out_hash.0, right.inputs.out_hash.0]),
            prover_id: inputs.prover_id,
        };
        let seed = public_inputs.end_archive_root;
        Ok(recursive(ProvingRequestType::RootRollup, public_inputs, &seed))
    }

    #[instrument(skip_all)]
    async fn get_tube_proof(&self, inputs: TubeInputs) -> anyhow::Result<ProofAndVerificationKey> {
        self.simulate(ProvingRequestType::TubeProof).await?;
        let seed = Fr::hash_of([&inputs.client_ivc_proof]);
        Ok(proof_and_vk(ProvingRequestType::TubeProof, &seed))
    }
}
