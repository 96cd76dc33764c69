//! Signature policy engine
//!
//! Each node owns an ordered set of signing and verification rules keyed by
//! action context. Outgoing payloads are signed by the most specific matching
//! signing rule; incoming payloads are checked against the most specific
//! matching verification rule (`VerifyNone` / `VerifyAny` / `VerifyAll`).
//!
//! The engine reports the verification outcome to its caller. Whether an
//! invalid signature rejects the message or merely flags it is per-rule
//! configuration ([`FailurePolicy`]), not a hardcoded engine behavior.
//!
//! Rule sets mutate at runtime. Lookups clone the rule list under a short
//! read lock, so an in-flight match always iterates a consistent snapshot.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::frame::Payload;

/// Signing method identifier carried in each signature record
pub const SIGNING_METHOD_ED25519: &str = "Ed25519";

/// A signature attached to a frame, hex-encoded for the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureRecord {
    /// Hex-encoded Ed25519 verifying key of the signer
    pub key_id: String,
    /// Hex-encoded 64-byte signature over the canonical payload bytes
    pub signature: String,
    pub signing_method: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Ed25519 keypair used by signing rules
pub struct KeyPair {
    key: SigningKey,
}

impl KeyPair {
    /// Generate a fresh keypair from OS entropy
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Deterministic keypair from a 32-byte seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(seed),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// Hex form of the verifying key, used as the wire `keyId`
    pub fn key_id(&self) -> String {
        hex::encode(self.key.verifying_key().to_bytes())
    }

    fn sign(&self, message: &[u8]) -> ed25519_dalek::Signature {
        self.key.sign(message)
    }
}

/// Which action/payload schemas a rule applies to.
///
/// `Action` is more specific than `Any`; the most specific matching rule
/// wins, ties broken by rule order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleContext {
    Any,
    Action(String),
}

impl RuleContext {
    fn matches(&self, action: &str) -> bool {
        match self {
            RuleContext::Any => true,
            RuleContext::Action(a) => a == action,
        }
    }

    fn specificity(&self) -> u8 {
        match self {
            RuleContext::Any => 0,
            RuleContext::Action(_) => 1,
        }
    }
}

type MetaGen = Arc<dyn Fn() -> String + Send + Sync>;
type TimestampGen = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Rule for signing outgoing payloads in a given context
pub struct SigningRule {
    context: RuleContext,
    keypair: Arc<KeyPair>,
    name_gen: Option<MetaGen>,
    description_gen: Option<MetaGen>,
    timestamp_gen: TimestampGen,
}

impl SigningRule {
    pub fn new(context: RuleContext, keypair: Arc<KeyPair>) -> Self {
        Self {
            context,
            keypair,
            name_gen: None,
            description_gen: None,
            timestamp_gen: Arc::new(Utc::now),
        }
    }

    pub fn with_name(mut self, gen: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.name_gen = Some(Arc::new(gen));
        self
    }

    pub fn with_description(mut self, gen: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.description_gen = Some(Arc::new(gen));
        self
    }

    pub fn with_timestamp(
        mut self,
        gen: impl Fn() -> DateTime<Utc> + Send + Sync + 'static,
    ) -> Self {
        self.timestamp_gen = Arc::new(gen);
        self
    }

    fn sign(&self, payload: &Payload) -> SignatureRecord {
        let signature = self.keypair.sign(&payload.canonical_bytes());
        SignatureRecord {
            key_id: self.keypair.key_id(),
            signature: hex::encode(signature.to_bytes()),
            signing_method: SIGNING_METHOD_ED25519.to_string(),
            name: self.name_gen.as_ref().map(|g| g()),
            description: self.description_gen.as_ref().map(|g| g()),
            timestamp: Some((self.timestamp_gen)()),
        }
    }
}

impl std::fmt::Debug for SigningRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningRule")
            .field("context", &self.context)
            .field("key_id", &self.keypair.key_id())
            .finish()
    }
}

/// How attached signatures are checked in a given context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyAction {
    /// Always succeeds, signatures ignored
    VerifyNone,
    /// At least one attached signature must validate against a trusted key
    VerifyAny,
    /// Every attached signature must validate against a trusted key
    VerifyAll,
}

/// Consequence of a failed verification: drop the frame, or deliver it with
/// the invalid status attached for the business layer to judge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    Reject,
    #[default]
    FlagAndContinue,
}

/// Rule for verifying incoming payloads in a given context
#[derive(Debug, Clone)]
pub struct VerificationRule {
    pub context: RuleContext,
    pub action: VerifyAction,
    /// Keys trusted to sign in this context. An empty list trusts any key
    /// whose signature validates (self-certifying mode).
    pub trust_anchors: Vec<VerifyingKey>,
    pub on_failure: FailurePolicy,
}

impl VerificationRule {
    pub fn new(context: RuleContext, action: VerifyAction) -> Self {
        Self {
            context,
            action,
            trust_anchors: Vec::new(),
            on_failure: FailurePolicy::default(),
        }
    }

    pub fn with_trust_anchor(mut self, key: VerifyingKey) -> Self {
        self.trust_anchors.push(key);
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.on_failure = policy;
        self
    }

    fn trusts(&self, key: &VerifyingKey) -> bool {
        self.trust_anchors.is_empty() || self.trust_anchors.contains(key)
    }
}

/// Outcome of checking one payload against the policy
#[derive(Debug, Clone, PartialEq)]
pub enum VerificationStatus {
    /// Required signatures were present and valid
    Valid,
    /// Nothing was required (VerifyNone or no matching rule)
    Unverified,
    Invalid { reason: String },
}

impl VerificationStatus {
    pub fn is_invalid(&self) -> bool {
        matches!(self, VerificationStatus::Invalid { .. })
    }
}

/// Verification status plus the configured consequence of failure
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationOutcome {
    pub status: VerificationStatus,
    pub on_failure: FailurePolicy,
}

impl VerificationOutcome {
    fn passed(status: VerificationStatus) -> Self {
        Self {
            status,
            on_failure: FailurePolicy::FlagAndContinue,
        }
    }

    /// Whether the caller should discard the frame
    pub fn should_reject(&self) -> bool {
        self.status.is_invalid() && self.on_failure == FailurePolicy::Reject
    }
}

struct PolicyState {
    signing: Vec<Arc<SigningRule>>,
    verification: Vec<Arc<VerificationRule>>,
    /// Applied when no verification rule matches. Permissive by default.
    default_action: VerifyAction,
    default_on_failure: FailurePolicy,
}

/// Per-node signature policy: independently owned, never shared across node
/// instances, mutable at runtime.
pub struct SignaturePolicy {
    state: RwLock<PolicyState>,
}

impl Default for SignaturePolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl SignaturePolicy {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(PolicyState {
                signing: Vec::new(),
                verification: Vec::new(),
                default_action: VerifyAction::VerifyNone,
                default_on_failure: FailurePolicy::FlagAndContinue,
            }),
        }
    }

    pub fn add_signing_rule(&self, rule: SigningRule) {
        self.state.write().signing.push(Arc::new(rule));
    }

    pub fn add_verification_rule(&self, rule: VerificationRule) {
        self.state.write().verification.push(Arc::new(rule));
    }

    /// Remove every signing rule for an exact context
    pub fn remove_signing_rules(&self, context: &RuleContext) {
        self.state.write().signing.retain(|r| r.context != *context);
    }

    /// Remove every verification rule for an exact context
    pub fn remove_verification_rules(&self, context: &RuleContext) {
        self.state
            .write()
            .verification
            .retain(|r| r.context != *context);
    }

    /// Behavior when no verification rule matches a context
    pub fn set_default_action(&self, action: VerifyAction, on_failure: FailurePolicy) {
        let mut state = self.state.write();
        state.default_action = action;
        state.default_on_failure = on_failure;
    }

    /// Sign a payload for the given action context.
    ///
    /// Returns an empty list when no signing rule matches: the payload is
    /// sent unsigned.
    pub fn sign(&self, action: &str, payload: &Payload) -> Vec<SignatureRecord> {
        let rule = {
            let state = self.state.read();
            most_specific(&state.signing, |r| &r.context, action)
        };

        match rule {
            Some(rule) => vec![rule.sign(payload)],
            None => Vec::new(),
        }
    }

    /// Verify attached signatures for the given action context
    pub fn verify(
        &self,
        action: &str,
        payload: &Payload,
        signatures: &[SignatureRecord],
    ) -> VerificationOutcome {
        // Snapshot the matching rule, then verify outside the lock
        let matched = {
            let state = self.state.read();
            match most_specific(&state.verification, |r| &r.context, action) {
                Some(rule) => Ok(rule),
                None => Err((state.default_action, state.default_on_failure)),
            }
        };

        match matched {
            Ok(rule) => VerificationOutcome {
                status: check_rule(&rule, payload, signatures),
                on_failure: rule.on_failure,
            },
            Err((VerifyAction::VerifyNone, _)) => {
                VerificationOutcome::passed(VerificationStatus::Unverified)
            }
            Err((action_default, on_failure)) => {
                debug!(action, "no verification rule, applying default {:?}", action_default);
                let fallback = VerificationRule::new(RuleContext::Any, action_default);
                VerificationOutcome {
                    status: check_rule(&fallback, payload, signatures),
                    on_failure,
                }
            }
        }
    }
}

/// Most specific matching rule, ties broken by rule order
fn most_specific<T, F>(rules: &[Arc<T>], context: F, action: &str) -> Option<Arc<T>>
where
    F: Fn(&T) -> &RuleContext,
{
    let mut best: Option<&Arc<T>> = None;
    for rule in rules {
        let ctx = context(rule);
        if !ctx.matches(action) {
            continue;
        }
        let better = match best {
            None => true,
            Some(current) => ctx.specificity() > context(current).specificity(),
        };
        if better {
            best = Some(rule);
        }
    }
    best.cloned()
}

fn check_rule(
    rule: &VerificationRule,
    payload: &Payload,
    signatures: &[SignatureRecord],
) -> VerificationStatus {
    match rule.action {
        VerifyAction::VerifyNone => VerificationStatus::Unverified,
        VerifyAction::VerifyAny => {
            if signatures.is_empty() {
                return VerificationStatus::Invalid {
                    reason: "no signatures attached".into(),
                };
            }
            let message = payload.canonical_bytes();
            let mut last_reason = String::new();
            for record in signatures {
                match check_record(rule, record, &message) {
                    Ok(()) => return VerificationStatus::Valid,
                    Err(reason) => last_reason = reason,
                }
            }
            VerificationStatus::Invalid {
                reason: last_reason,
            }
        }
        VerifyAction::VerifyAll => {
            if signatures.is_empty() {
                return VerificationStatus::Invalid {
                    reason: "no signatures attached".into(),
                };
            }
            let message = payload.canonical_bytes();
            for record in signatures {
                if let Err(reason) = check_record(rule, record, &message) {
                    return VerificationStatus::Invalid { reason };
                }
            }
            VerificationStatus::Valid
        }
    }
}

fn check_record(
    rule: &VerificationRule,
    record: &SignatureRecord,
    message: &[u8],
) -> Result<(), String> {
    if record.signing_method != SIGNING_METHOD_ED25519 {
        return Err(format!("unsupported signing method: {}", record.signing_method));
    }

    let key_bytes: [u8; 32] = hex::decode(&record.key_id)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| "malformed key id".to_string())?;
    let key = VerifyingKey::from_bytes(&key_bytes).map_err(|e| format!("invalid key: {}", e))?;

    if !rule.trusts(&key) {
        return Err(format!("key {} is not a trust anchor", record.key_id));
    }

    let sig_bytes: [u8; 64] = hex::decode(&record.signature)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| "malformed signature".to_string())?;
    let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);

    key.verify(message, &signature)
        .map_err(|e| format!("signature verification failed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> Payload {
        Payload::Json(json!({"status": "Accepted", "evseId": 2}))
    }

    #[test]
    fn test_unmatched_context_sends_unsigned() {
        let policy = SignaturePolicy::new();
        assert!(policy.sign("Reset", &payload()).is_empty());
    }

    #[test]
    fn test_sign_and_verify_round_trip() {
        let keypair = Arc::new(KeyPair::generate());
        let policy = SignaturePolicy::new();
        policy.add_signing_rule(
            SigningRule::new(RuleContext::Action("Reset".into()), keypair.clone())
                .with_name(|| "station-key".to_string()),
        );
        policy.add_verification_rule(
            VerificationRule::new(RuleContext::Action("Reset".into()), VerifyAction::VerifyAll)
                .with_trust_anchor(keypair.verifying_key()),
        );

        let sigs = policy.sign("Reset", &payload());
        assert_eq!(sigs.len(), 1);
        assert_eq!(sigs[0].name.as_deref(), Some("station-key"));
        assert!(sigs[0].timestamp.is_some());

        let outcome = policy.verify("Reset", &payload(), &sigs);
        assert_eq!(outcome.status, VerificationStatus::Valid);
        assert!(!outcome.should_reject());
    }

    #[test]
    fn test_most_specific_rule_wins() {
        let any_key = Arc::new(KeyPair::from_seed(&[1; 32]));
        let reset_key = Arc::new(KeyPair::from_seed(&[2; 32]));

        let policy = SignaturePolicy::new();
        policy.add_signing_rule(SigningRule::new(RuleContext::Any, any_key.clone()));
        policy.add_signing_rule(SigningRule::new(
            RuleContext::Action("Reset".into()),
            reset_key.clone(),
        ));

        let sigs = policy.sign("Reset", &payload());
        assert_eq!(sigs[0].key_id, reset_key.key_id());

        let sigs = policy.sign("Heartbeat", &payload());
        assert_eq!(sigs[0].key_id, any_key.key_id());
    }

    #[test]
    fn test_verify_none_ignores_garbage() {
        let policy = SignaturePolicy::new();
        policy.add_verification_rule(VerificationRule::new(
            RuleContext::Any,
            VerifyAction::VerifyNone,
        ));

        let garbage = vec![SignatureRecord {
            key_id: "zz".into(),
            signature: "not hex".into(),
            signing_method: SIGNING_METHOD_ED25519.into(),
            name: None,
            description: None,
            timestamp: None,
        }];
        let outcome = policy.verify("Reset", &payload(), &garbage);
        assert_eq!(outcome.status, VerificationStatus::Unverified);
    }

    #[test]
    fn test_no_rule_defaults_to_unverified() {
        let policy = SignaturePolicy::new();
        let outcome = policy.verify("Reset", &payload(), &[]);
        assert_eq!(outcome.status, VerificationStatus::Unverified);
    }

    #[test]
    fn test_strict_default_action() {
        let policy = SignaturePolicy::new();
        policy.set_default_action(VerifyAction::VerifyAny, FailurePolicy::Reject);

        let outcome = policy.verify("Reset", &payload(), &[]);
        assert!(outcome.status.is_invalid());
        assert!(outcome.should_reject());
    }

    #[test]
    fn test_verify_all_detects_single_bit_tamper() {
        let keypair = Arc::new(KeyPair::generate());
        let policy = SignaturePolicy::new();
        policy.add_signing_rule(SigningRule::new(RuleContext::Any, keypair.clone()));
        policy.add_verification_rule(
            VerificationRule::new(RuleContext::Any, VerifyAction::VerifyAll)
                .with_trust_anchor(keypair.verifying_key()),
        );

        let original = payload();
        let sigs = policy.sign("Reset", &original);

        // Flip one bit in every byte position of the canonical form
        let canonical = original.canonical_bytes();
        for i in 0..canonical.len() {
            let mut tampered = canonical.clone();
            tampered[i] ^= 0x01;
            let tampered = Payload::Binary(tampered);
            let outcome = policy.verify("Reset", &tampered, &sigs);
            assert!(
                outcome.status.is_invalid(),
                "bit flip at byte {} went undetected",
                i
            );
        }
    }

    #[test]
    fn test_verify_any_accepts_one_valid_among_bad() {
        let trusted = Arc::new(KeyPair::generate());
        let policy = SignaturePolicy::new();
        policy.add_signing_rule(SigningRule::new(RuleContext::Any, trusted.clone()));
        policy.add_verification_rule(
            VerificationRule::new(RuleContext::Any, VerifyAction::VerifyAny)
                .with_trust_anchor(trusted.verifying_key()),
        );

        let mut sigs = policy.sign("Reset", &payload());
        sigs.insert(
            0,
            SignatureRecord {
                key_id: "00".into(),
                signature: "11".into(),
                signing_method: SIGNING_METHOD_ED25519.into(),
                name: None,
                description: None,
                timestamp: None,
            },
        );

        let outcome = policy.verify("Reset", &payload(), &sigs);
        assert_eq!(outcome.status, VerificationStatus::Valid);
    }

    #[test]
    fn test_untrusted_signer_rejected() {
        let trusted = Arc::new(KeyPair::from_seed(&[3; 32]));
        let rogue = Arc::new(KeyPair::from_seed(&[4; 32]));

        let policy = SignaturePolicy::new();
        policy.add_signing_rule(SigningRule::new(RuleContext::Any, rogue));
        policy.add_verification_rule(
            VerificationRule::new(RuleContext::Any, VerifyAction::VerifyAll)
                .with_trust_anchor(trusted.verifying_key())
                .with_failure_policy(FailurePolicy::Reject),
        );

        let sigs = policy.sign("Reset", &payload());
        let outcome = policy.verify("Reset", &payload(), &sigs);
        assert!(outcome.status.is_invalid());
        assert!(outcome.should_reject());
    }

    #[test]
    fn test_rules_removable_at_runtime() {
        let keypair = Arc::new(KeyPair::generate());
        let context = RuleContext::Action("Reset".into());
        let policy = SignaturePolicy::new();
        policy.add_signing_rule(SigningRule::new(context.clone(), keypair));

        assert_eq!(policy.sign("Reset", &payload()).len(), 1);
        policy.remove_signing_rules(&context);
        assert!(policy.sign("Reset", &payload()).is_empty());
    }
}
