//! The closed set of decisions a search method can emit.

use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::{Builder, Uuid};

use crate::space::Hyperparameters;
use crate::workload::Length;

/// Identifies one trial instance. Generated from the search RNG so that a
/// seeded search always produces the same ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 16];
        rng.fill(&mut bytes);
        Self(Builder::from_random_bytes(bytes).into_uuid())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request a new trial, optionally warm-started from another trial's latest
/// checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Create {
    pub request_id: RequestId,
    pub trial_seed: u32,
    pub hparams: Hyperparameters,
    pub parent: Option<RequestId>,
}

impl Create {
    pub fn new<R: Rng + ?Sized>(rng: &mut R, hparams: Hyperparameters) -> Self {
        let request_id = RequestId::generate(rng);
        let trial_seed = rng.gen_range(0..1u32 << 31);
        Self {
            request_id,
            trial_seed,
            hparams,
            parent: None,
        }
    }

    pub fn from_parent<R: Rng + ?Sized>(
        rng: &mut R,
        hparams: Hyperparameters,
        parent: RequestId,
    ) -> Self {
        Self {
            parent: Some(parent),
            ..Self::new(rng, hparams)
        }
    }
}

/// Request further training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Train {
    pub request_id: RequestId,
    pub length: Length,
}

/// Request a validation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validate {
    pub request_id: RequestId,
}

/// Request a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub request_id: RequestId,
}

/// Request orderly teardown of a trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Close {
    pub request_id: RequestId,
}

/// Terminate the whole search.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shutdown {
    pub failure: bool,
}

/// A decision emitted by a search method for the executor to carry out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    Create(Create),
    Train(Train),
    Validate(Validate),
    Checkpoint(Checkpoint),
    Close(Close),
    Shutdown(Shutdown),
}

impl Operation {
    pub fn train(request_id: RequestId, length: Length) -> Self {
        Self::Train(Train { request_id, length })
    }

    pub fn validate(request_id: RequestId) -> Self {
        Self::Validate(Validate { request_id })
    }

    pub fn checkpoint(request_id: RequestId) -> Self {
        Self::Checkpoint(Checkpoint { request_id })
    }

    pub fn close(request_id: RequestId) -> Self {
        Self::Close(Close { request_id })
    }

    pub fn shutdown() -> Self {
        Self::Shutdown(Shutdown { failure: false })
    }

    pub fn shutdown_failure() -> Self {
        Self::Shutdown(Shutdown { failure: true })
    }

    /// The trial this operation targets, if any.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Self::Create(op) => Some(op.request_id),
            Self::Train(op) => Some(op.request_id),
            Self::Validate(op) => Some(op.request_id),
            Self::Checkpoint(op) => Some(op.request_id),
            Self::Close(op) => Some(op.request_id),
            Self::Shutdown(_) => None,
        }
    }
}

impl From<Create> for Operation {
    fn from(create: Create) -> Self {
        Self::Create(create)
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create(op) => match op.parent {
                Some(parent) => write!(f, "Create({} from {parent})", op.request_id),
                None => write!(f, "Create({})", op.request_id),
            },
            Self::Train(op) => write!(f, "Train({}, {})", op.request_id, op.length),
            Self::Validate(op) => write!(f, "Validate({})", op.request_id),
            Self::Checkpoint(op) => write!(f, "Checkpoint({})", op.request_id),
            Self::Close(op) => write!(f, "Close({})", op.request_id),
            Self::Shutdown(op) => write!(f, "Shutdown(failure={})", op.failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn request_ids_are_seed_deterministic() {
        let mut a = ChaCha8Rng::seed_from_u64(7);
        let mut b = ChaCha8Rng::seed_from_u64(7);
        let ids_a: Vec<_> = (0..5).map(|_| RequestId::generate(&mut a)).collect();
        let ids_b: Vec<_> = (0..5).map(|_| RequestId::generate(&mut b)).collect();
        assert_eq!(ids_a, ids_b);
        assert_ne!(ids_a[0], ids_a[1]);
    }

    #[test]
    fn create_from_parent_records_parent() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let parent = Create::new(&mut rng, Hyperparameters::new());
        let child = Create::from_parent(&mut rng, parent.hparams.clone(), parent.request_id);
        assert_eq!(child.parent, Some(parent.request_id));
        assert_ne!(child.request_id, parent.request_id);
        assert!(child.trial_seed < 1 << 31);
    }

    #[test]
    fn operation_request_id() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let id = RequestId::generate(&mut rng);
        assert_eq!(Operation::validate(id).request_id(), Some(id));
        assert_eq!(Operation::shutdown().request_id(), None);
    }

    #[test]
    fn operation_serialization() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let id = RequestId::generate(&mut rng);
        let op = Operation::train(id, Length::batches(10));
        let json = serde_json::to_string(&op).unwrap();
        assert!(json.contains("\"type\":\"train\""));
        let back: Operation = serde_json::from_str(&json).unwrap();
        assert_eq!(op, back);
    }
}
