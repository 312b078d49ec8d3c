use crate::engine::store::Message;
use crate::error::PrivacyError;
use crate::engine::util::now_epoch_secs;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Tenant-scoped pseudonymization policy. The same raw author under two
/// different tenants (or sources) must map to two unrelated pseudonyms.
#[derive(Debug, Clone)]
pub struct PrivacyPolicy {
    pub tenant: String,
    pub source: String,
}

impl PrivacyPolicy {
    pub fn new(tenant: &str, source: &str) -> Result<Self, PrivacyError> {
        if tenant.trim().is_empty() {
            return Err(PrivacyError::InvalidPolicy(
                "tenant cannot be empty".to_string(),
            ));
        }
        if source.trim().is_empty() {
            return Err(PrivacyError::InvalidPolicy(
                "source cannot be empty".to_string(),
            ));
        }
        Ok(Self {
            tenant: tenant.trim().to_string(),
            source: source.trim().to_string(),
        })
    }
}

/// Proof that the message set flowing toward the generator went through
/// [`seal_messages`]. The private unit field means no code outside this
/// module can construct one, so any function that demands a `&PrivacyPass`
/// is unreachable with raw identifiers.
#[derive(Debug)]
pub struct PrivacyPass {
    pub run_id: String,
    pub issued_at_epoch_secs: u64,
    _issued: (),
}

#[derive(Debug)]
pub struct SealedBatch {
    pub messages: Vec<Message>,
    pub pass: PrivacyPass,
    pub pseudonym_count: usize,
}

pub fn pseudonymize_author(policy: &PrivacyPolicy, raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(
        format!("gazette-author:{}:{}:{raw}", policy.tenant, policy.source).as_bytes(),
    );
    let digest = format!("{:x}", hasher.finalize());
    format!("p-{}", &digest[..16])
}

fn looks_sealed(author: &str) -> bool {
    author.len() == 18
        && author.starts_with("p-")
        && author[2..].chars().all(|c| c.is_ascii_hexdigit())
}

/// Replace every raw author with its deterministic pseudonym and issue the
/// pass that downstream generation requires. Already-sealed authors pass
/// through unchanged so a resumed run never double-hashes.
pub fn seal_messages(
    policy: &PrivacyPolicy,
    run_id: &str,
    messages: Vec<Message>,
) -> Result<SealedBatch, PrivacyError> {
    let mut mapping: BTreeMap<String, String> = BTreeMap::new();
    let mut sealed = Vec::with_capacity(messages.len());

    for mut message in messages {
        let author = if looks_sealed(&message.author) {
            message.author.clone()
        } else {
            mapping
                .entry(message.author.clone())
                .or_insert_with(|| pseudonymize_author(policy, &message.author))
                .clone()
        };
        message.author = author;
        if !looks_sealed(&message.author) {
            return Err(PrivacyError::RawIdentifierLeak {
                message_id: message.id.clone(),
            });
        }
        sealed.push(message);
    }

    let issued_at_epoch_secs = now_epoch_secs().map_err(|err| {
        PrivacyError::InvalidPolicy(format!("clock unavailable while issuing pass: {err}"))
    })?;

    Ok(SealedBatch {
        messages: sealed,
        pseudonym_count: mapping.len(),
        pass: PrivacyPass {
            run_id: run_id.to_string(),
            issued_at_epoch_secs,
            _issued: (),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::{PrivacyPolicy, pseudonymize_author, seal_messages};
    use crate::engine::store::Message;

    fn msg(id: &str, author: &str) -> Message {
        Message {
            id: id.to_string(),
            thread_id: "t1".to_string(),
            timestamp: 100,
            author: author.to_string(),
            text: "hello".to_string(),
            attachment_refs: Vec::new(),
        }
    }

    #[test]
    fn pseudonyms_are_deterministic_per_tenant() {
        let a = PrivacyPolicy::new("acme", "chat-export").expect("policy");
        let b = PrivacyPolicy::new("globex", "chat-export").expect("policy");

        assert_eq!(pseudonymize_author(&a, "alice"), pseudonymize_author(&a, "alice"));
        assert_ne!(pseudonymize_author(&a, "alice"), pseudonymize_author(&b, "alice"));
        assert_ne!(pseudonymize_author(&a, "alice"), pseudonymize_author(&a, "bob"));
    }

    #[test]
    fn sealing_replaces_every_author() {
        let policy = PrivacyPolicy::new("acme", "chat-export").expect("policy");
        let batch = seal_messages(
            &policy,
            "run-1",
            vec![msg("m1", "alice"), msg("m2", "bob"), msg("m3", "alice")],
        )
        .expect("seal");

        assert_eq!(batch.pseudonym_count, 2);
        assert_eq!(batch.messages[0].author, batch.messages[2].author);
        for message in &batch.messages {
            assert!(message.author.starts_with("p-"));
            assert_eq!(message.author.len(), 18);
        }
    }

    #[test]
    fn sealing_is_idempotent() {
        let policy = PrivacyPolicy::new("acme", "chat-export").expect("policy");
        let once = seal_messages(&policy, "run-1", vec![msg("m1", "alice")]).expect("seal");
        let sealed_author = once.messages[0].author.clone();

        let twice =
            seal_messages(&policy, "run-2", once.messages).expect("re-seal");
        assert_eq!(twice.messages[0].author, sealed_author);
        assert_eq!(twice.pseudonym_count, 0);
    }

    #[test]
    fn rejects_empty_tenant() {
        assert!(PrivacyPolicy::new("  ", "chat-export").is_err());
    }
}
