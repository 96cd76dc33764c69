//! Station state machine
//!
//! Pure business logic, independent of the transport: every operation takes
//! a typed request and returns a typed response. Handler registration lives
//! in [`crate::handlers`].

use std::collections::BTreeMap;

use chrono::Utc;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::types::*;

/// Hex SHA-256 identity of a certificate body
pub fn certificate_hash(certificate: &str) -> String {
    hex::encode(Sha256::digest(certificate.as_bytes()))
}

#[derive(Debug, Clone)]
struct CertificateEntry {
    certificate_type: CertificateType,
    certificate: String,
}

#[derive(Debug, Default)]
struct StationState {
    display_messages: BTreeMap<i32, DisplayMessage>,
    certificates: BTreeMap<String, CertificateEntry>,
}

/// One charging station: a fixed set of EVSEs plus mutable display-message
/// and certificate stores.
#[derive(Debug)]
pub struct Station {
    evse_ids: Vec<u32>,
    heartbeat_interval: u32,
    state: RwLock<StationState>,
}

impl Station {
    /// Station with EVSE ids `1..=evse_count`
    pub fn new(evse_count: u32) -> Self {
        Self {
            evse_ids: (1..=evse_count).collect(),
            heartbeat_interval: 300,
            state: RwLock::new(StationState::default()),
        }
    }

    pub fn with_heartbeat_interval(mut self, seconds: u32) -> Self {
        self.heartbeat_interval = seconds;
        self
    }

    pub fn evse_ids(&self) -> &[u32] {
        &self.evse_ids
    }

    /// Reset the station or one EVSE. An EVSE id the station does not
    /// expose is rejected; that is business content, not a protocol error.
    pub fn reset(&self, req: &ResetRequest) -> ResetResponse {
        match req.evse_id {
            Some(evse_id) if !self.evse_ids.contains(&evse_id) => ResetResponse {
                status: GenericStatus::Rejected,
                status_info: Some(format!("no EVSE with id {}", evse_id)),
            },
            evse_id => {
                info!(?evse_id, reset_type = ?req.reset_type, "reset accepted");
                ResetResponse {
                    status: GenericStatus::Accepted,
                    status_info: None,
                }
            }
        }
    }

    /// Idempotent upsert keyed by message id
    pub fn set_display_message(&self, req: &SetDisplayMessageRequest) -> SetDisplayMessageResponse {
        self.state
            .write()
            .display_messages
            .insert(req.message.id, req.message.clone());
        SetDisplayMessageResponse {
            status: GenericStatus::Accepted,
        }
    }

    /// Filter by id subset and/or state; no filters returns everything
    pub fn get_display_messages(
        &self,
        req: &GetDisplayMessagesRequest,
    ) -> GetDisplayMessagesResponse {
        let state = self.state.read();
        let messages = state
            .display_messages
            .values()
            .filter(|m| match &req.id {
                Some(ids) => ids.contains(&m.id),
                None => true,
            })
            .filter(|m| match req.state {
                Some(s) => m.state == s,
                None => true,
            })
            .cloned()
            .collect();
        GetDisplayMessagesResponse { messages }
    }

    pub fn clear_display_message(
        &self,
        req: &ClearDisplayMessageRequest,
    ) -> ClearDisplayMessageResponse {
        let removed = self.state.write().display_messages.remove(&req.id);
        ClearDisplayMessageResponse {
            status: match removed {
                Some(_) => GenericStatus::Accepted,
                None => GenericStatus::Rejected,
            },
        }
    }

    /// Install keyed by content hash; reinstalling the same body is a no-op
    pub fn install_certificate(&self, req: &InstallCertificateRequest) -> InstallCertificateResponse {
        let hash = certificate_hash(&req.certificate);
        self.state.write().certificates.insert(
            hash,
            CertificateEntry {
                certificate_type: req.certificate_type,
                certificate: req.certificate.clone(),
            },
        );
        InstallCertificateResponse {
            status: GenericStatus::Accepted,
        }
    }

    pub fn installed_certificate_ids(
        &self,
        req: &GetInstalledCertificateIdsRequest,
    ) -> GetInstalledCertificateIdsResponse {
        let state = self.state.read();
        let certificate_ids = state
            .certificates
            .iter()
            .filter(|(_, entry)| match req.certificate_type {
                Some(t) => entry.certificate_type == t,
                None => true,
            })
            .map(|(hash, entry)| CertificateId {
                certificate_type: entry.certificate_type,
                certificate_hash: hash.clone(),
            })
            .collect();
        GetInstalledCertificateIdsResponse { certificate_ids }
    }

    /// Body of an installed certificate, by hash
    pub fn certificate_body(&self, hash: &str) -> Option<String> {
        self.state
            .read()
            .certificates
            .get(hash)
            .map(|e| e.certificate.clone())
    }

    pub fn delete_certificate(&self, req: &DeleteCertificateRequest) -> DeleteCertificateResponse {
        let removed = self
            .state
            .write()
            .certificates
            .remove(&req.certificate_hash);
        DeleteCertificateResponse {
            status: match removed {
                Some(_) => GenericStatus::Accepted,
                None => GenericStatus::Rejected,
            },
        }
    }

    pub fn heartbeat(&self) -> HeartbeatResponse {
        HeartbeatResponse {
            current_time: Utc::now(),
        }
    }

    pub fn boot_notification(&self, req: &BootNotificationRequest) -> BootNotificationResponse {
        info!(model = %req.model, vendor = %req.vendor_name, "boot notification");
        BootNotificationResponse {
            status: GenericStatus::Accepted,
            current_time: Utc::now(),
            interval: self.heartbeat_interval,
        }
    }
}
