use fixed_hash::construct_fixed_hash;
use impl_serde::impl_fixed_hash_serde;

pub use ethereum_types::H256;

pub type CommitteeIndex = u64;
pub type Epoch = u64;
pub type Gwei = u64;
pub type Slot = u64;
pub type UnixSeconds = u64;
pub type ValidatorIndex = u64;
pub type WithdrawalIndex = u64;

/// Signed counterpart of [`Gwei`] used for balance deltas.
pub type GweiDelta = i64;

construct_fixed_hash! {
    pub struct PublicKeyBytes(48);
}

impl_fixed_hash_serde!(PublicKeyBytes, 48);
