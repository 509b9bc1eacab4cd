//! Moderation primitives: the moderator-list hash, sanction signing and
//! verification, and the sanctions credentials.
//!
//! Every sanction is individually signed by its issuer; the list as a
//! whole is authenticated by the credentials, signed by whoever edited
//! it last. Verification accepts issuers that are in the current mod
//! list or are the founder.

use palaver_crypto::{ed25519, hash};
use palaver_types::state::{Sanction, SanctionKind, SanctionsCreds};
use palaver_types::{BanId, SigPublicKey};
use palaver_wire::records;

use crate::chat::Chat;
use crate::{GroupError, Result};

/// Hash of a packed moderator list. The empty list hashes to zero so a
/// freshly created group's shared state is self-describing.
pub fn mod_list_hash(mods: &[SigPublicKey]) -> [u8; 32] {
    if mods.is_empty() {
        return [0u8; 32];
    }
    hash::hash(&records::mod_list_hashable(mods))
}

/// Checksum over a packed sanctions list.
pub fn sanctions_checksum(sanctions: &[Sanction]) -> [u8; 32] {
    if sanctions.is_empty() {
        return [0u8; 32];
    }
    hash::hash(&records::sanctions_hashable(sanctions))
}

/// Verify one sanction entry against the set of allowed issuers.
pub fn verify_sanction(
    sanction: &Sanction,
    mod_list: &[SigPublicKey],
    founder_sig_pk: &SigPublicKey,
) -> Result<()> {
    let issuer_allowed = sanction.issuer_sig_pk == *founder_sig_pk
        || mod_list.iter().any(|k| *k == sanction.issuer_sig_pk);
    if !issuer_allowed {
        return Err(GroupError::BadSignature);
    }
    ed25519::verify_detached(
        &sanction.issuer_sig_pk,
        &records::sanction_signable(sanction),
        &sanction.signature,
    )?;
    Ok(())
}

/// Verify a full sanctions list and its credentials.
pub fn verify_sanctions_list(
    sanctions: &[Sanction],
    creds: &SanctionsCreds,
    mod_list: &[SigPublicKey],
    founder_sig_pk: &SigPublicKey,
) -> Result<()> {
    for sanction in sanctions {
        verify_sanction(sanction, mod_list, founder_sig_pk)?;
    }

    if creds.checksum != sanctions_checksum(sanctions) {
        return Err(GroupError::BadSignature);
    }

    let editor_allowed =
        creds.sig_pk == *founder_sig_pk || mod_list.iter().any(|k| *k == creds.sig_pk);
    if !editor_allowed {
        return Err(GroupError::BadSignature);
    }
    ed25519::verify_detached(
        &creds.sig_pk,
        &records::creds_signable(creds.version, &creds.checksum),
        &creds.signature,
    )?;
    Ok(())
}

impl Chat {
    /// Sign a new sanction as ourselves.
    ///
    /// # Errors
    ///
    /// [`GroupError::RoleInsufficient`] if we are neither founder nor
    /// moderator.
    pub(crate) fn make_sanction(&self, kind: SanctionKind, now: u64) -> Result<Sanction> {
        if !self.self_peer().role.is_privileged() {
            return Err(GroupError::RoleInsufficient);
        }
        let mut sanction = Sanction {
            issuer_sig_pk: self.self_keys.public.sig,
            timestamp: now,
            kind,
            signature: [0u8; 64],
        };
        let signable = records::sanction_signable(&sanction);
        sanction.signature = self.self_keys.sig_secret.sign(&signable).to_bytes();
        Ok(sanction)
    }

    /// Regenerate the credentials over the current sanctions list,
    /// signed by us. `bump` advances the version (every mutation does;
    /// initialization does not).
    ///
    /// # Errors
    ///
    /// [`GroupError::VersionStale`] if the version counter is exhausted.
    pub(crate) fn regenerate_sanctions_creds(&mut self, bump: bool) -> Result<()> {
        let version = if bump {
            self.sanctions_creds
                .version
                .checked_add(1)
                .ok_or(GroupError::VersionStale)?
        } else {
            self.sanctions_creds.version
        };
        let checksum = sanctions_checksum(&self.sanctions);
        let signature = self
            .self_keys
            .sig_secret
            .sign(&records::creds_signable(version, &checksum))
            .to_bytes();
        self.sanctions_creds = SanctionsCreds {
            version,
            checksum,
            sig_pk: self.self_keys.public.sig,
            signature,
        };
        Ok(())
    }

    /// Initialize the credentials at group creation.
    pub(crate) fn init_sanctions_creds(&mut self, _now: u64) -> Result<()> {
        self.regenerate_sanctions_creds(false)
    }

    /// Re-sign every sanction issued by `removed_sig_pk` as ourselves.
    /// Called by the founder when demoting a moderator so the list stays
    /// verifiable, then regenerates the credentials.
    pub(crate) fn reissue_sanctions_of(&mut self, removed_sig_pk: &SigPublicKey, now: u64) -> Result<()> {
        let self_sig_pk = self.self_keys.public.sig;
        let mut changed = false;
        for sanction in &mut self.sanctions {
            if &sanction.issuer_sig_pk == removed_sig_pk {
                sanction.issuer_sig_pk = self_sig_pk;
                sanction.timestamp = now;
                let signable = records::sanction_signable(sanction);
                sanction.signature = self.self_keys.sig_secret.sign(&signable).to_bytes();
                changed = true;
            }
        }
        if changed {
            self.regenerate_sanctions_creds(true)?;
        }
        Ok(())
    }

    /// Next unused ban id.
    pub(crate) fn next_ban_id(&self) -> BanId {
        let mut id: BanId = 1;
        loop {
            let taken = self.sanctions.iter().any(|s| {
                matches!(s.kind, SanctionKind::Ban { ban_id, .. } if ban_id == id)
            });
            if !taken {
                return id;
            }
            id = id.wrapping_add(1);
        }
    }

    /// Drop the oldest moderator with no live connection to make room
    /// for a new entry.
    pub(crate) fn prune_mod_list(&mut self) {
        let connected: Vec<SigPublicKey> = self
            .entries
            .iter()
            .skip(1)
            .filter_map(|e| e.conn.as_ref().map(|c| c.sig_pk))
            .collect();

        if let Some(pos) = self
            .mod_list
            .iter()
            .position(|k| !connected.iter().any(|c| c == k))
        {
            let removed = self.mod_list.remove(pos);
            tracing::debug!(
                group = self.group_number,
                moderator = %palaver_types::fmt_key(&removed),
                "pruned offline moderator"
            );
        }
    }
}
