//! Replicated group-state records.
//!
//! These are the four versioned artifacts every member replicates: the
//! founder-signed shared state, the moderator list, the sanctions list
//! with its credentials, and the topic. Verification logic lives in the
//! group core; these are the plain data carriers.

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::identity::ExtendedPublicKey;
use crate::network::IpPort;
use crate::peer::Privacy;
use crate::{BanId, PublicKey, SigPublicKey, SignatureBytes};

/// Founder-signed group configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedState {
    /// The founder's extended public key.
    pub founder: ExtendedPublicKey,
    /// Hard cap on group size.
    pub max_peers: u32,
    /// Group name, 1..=MAX_GROUP_NAME_SIZE bytes.
    pub group_name: Vec<u8>,
    /// Privacy state.
    pub privacy: Privacy,
    /// Optional password, up to MAX_PASSWORD_SIZE bytes; empty when unset.
    pub password: Vec<u8>,
    /// BLAKE3 hash over the packed moderator list.
    pub mod_list_hash: [u8; 32],
    /// Monotonically increasing version.
    pub version: u32,
}

/// The group topic together with its authentication metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicInfo {
    /// Topic bytes, up to MAX_TOPIC_SIZE.
    pub topic: Vec<u8>,
    /// Signing public key of the peer that set the topic.
    pub setter_sig_pk: SigPublicKey,
    /// Monotonically increasing version.
    pub version: u32,
}

/// The target of a sanction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SanctionKind {
    /// The peer with this encryption key is muted.
    Observer { public_key: PublicKey },
    /// The address is banned; `ban_id` names the entry for removal.
    Ban { ip_port: IpPort, ban_id: BanId },
}

impl SanctionKind {
    /// Wire discriminant.
    pub fn tag(&self) -> u8 {
        match self {
            SanctionKind::Observer { .. } => 0,
            SanctionKind::Ban { .. } => 1,
        }
    }
}

/// A single sanction entry, individually signed by its issuer.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sanction {
    /// Signing public key of the moderator or founder that issued this.
    pub issuer_sig_pk: SigPublicKey,
    /// Unix time the sanction was issued.
    pub timestamp: u64,
    /// What is sanctioned.
    pub kind: SanctionKind,
    /// Detached signature by the issuer over the packed entry.
    #[serde_as(as = "serde_with::Bytes")]
    pub signature: SignatureBytes,
}

/// Credentials authenticating the sanctions list as a whole.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanctionsCreds {
    /// Running version, incremented on every list mutation.
    pub version: u32,
    /// BLAKE3 checksum over the packed sanctions list.
    pub checksum: [u8; 32],
    /// Signing public key of the most recent editor.
    pub sig_pk: SigPublicKey,
    /// Detached signature by the editor over `(version, checksum)`.
    #[serde_as(as = "serde_with::Bytes")]
    pub signature: SignatureBytes,
}

impl Default for SanctionsCreds {
    fn default() -> Self {
        Self {
            version: 0,
            checksum: [0u8; 32],
            sig_pk: [0u8; 32],
            signature: [0u8; 64],
        }
    }
}
