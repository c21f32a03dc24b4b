use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::config::MailSection;
use crate::identity::Identity;

use super::{CodeQuery, Inbox, MailError, MailProvider, MailResult};

const PROVIDER_ID: &str = "gmail-alias";

/// Derives deliverable aliases from one real gmail mailbox. Everything sent
/// to an alias lands in the base inbox, so there is nothing to create or
/// release server-side, and nothing this provider can read back.
pub struct GmailAliasProvider {
    config: MailSection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AliasStyle {
    Plus,
    Dot,
    DomainSwap,
}

impl GmailAliasProvider {
    pub fn new(config: MailSection) -> Self {
        Self { config }
    }

    fn base_parts(&self) -> MailResult<(String, String)> {
        let base = self
            .config
            .base_address
            .as_deref()
            .ok_or_else(|| MailError::NotConfigured(PROVIDER_ID.to_string()))?;
        match base.split_once('@') {
            Some((local, domain)) if !local.is_empty() && !domain.is_empty() => {
                Ok((local.to_string(), domain.to_string()))
            }
            _ => Err(MailError::Provider(format!(
                "base address {base} is not a mailbox"
            ))),
        }
    }

    fn pick_style<R: Rng>(&self, rng: &mut R) -> AliasStyle {
        match self.config.alias_style.as_str() {
            "plus" => AliasStyle::Plus,
            "dot" => AliasStyle::Dot,
            "domain-swap" => AliasStyle::DomainSwap,
            // "auto": plus aliases are the most reliably accepted, dots next,
            // the googlemail swap only as seasoning.
            _ => match rng.gen_range(0..10) {
                0..=6 => AliasStyle::Plus,
                7..=8 => AliasStyle::Dot,
                _ => AliasStyle::DomainSwap,
            },
        }
    }

    fn alias<R: Rng>(&self, identity: &Identity, rng: &mut R) -> MailResult<String> {
        let (local, domain) = self.base_parts()?;
        let stripped: String = local.chars().filter(|c| *c != '.').collect();
        let hint = name_hint(identity);
        Ok(match self.pick_style(rng) {
            AliasStyle::Plus => {
                let suffix = random_suffix(rng);
                format!("{stripped}+{hint}{suffix}@{domain}")
            }
            AliasStyle::Dot => {
                let dotted = dot_variant(&stripped, rng);
                format!("{dotted}@{domain}")
            }
            AliasStyle::DomainSwap => {
                let swapped = if domain.eq_ignore_ascii_case("googlemail.com") {
                    "gmail.com"
                } else {
                    "googlemail.com"
                };
                let suffix = random_suffix(rng);
                format!("{stripped}+{hint}{suffix}@{swapped}")
            }
        })
    }
}

/// Short, address-safe tag taken from the identity so a human scanning the
/// base inbox can tell aliases apart.
fn name_hint(identity: &Identity) -> String {
    identity
        .first_name
        .chars()
        .chain(identity.last_name.chars())
        .filter(|c| c.is_ascii_alphanumeric())
        .take(4)
        .collect::<String>()
        .to_ascii_lowercase()
}

fn random_suffix<R: Rng>(rng: &mut R) -> String {
    rng.sample_iter(&Alphanumeric)
        .take(6)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect()
}

/// Re-inserts dots into the local part at random positions. Gmail ignores
/// them for delivery but most services treat the result as a new address.
fn dot_variant<R: Rng>(local: &str, rng: &mut R) -> String {
    let chars: Vec<char> = local.chars().collect();
    if chars.len() < 2 {
        return local.to_string();
    }
    let mut out = String::with_capacity(chars.len() * 2);
    let mut inserted = false;
    for (i, c) in chars.iter().enumerate() {
        out.push(*c);
        if i + 1 < chars.len() && rng.gen_bool(0.4) {
            out.push('.');
            inserted = true;
        }
    }
    if !inserted {
        // Degenerate roll; force one dot so the variant differs from base.
        let mut forced = String::with_capacity(chars.len() + 1);
        forced.push(chars[0]);
        forced.push('.');
        forced.extend(&chars[1..]);
        return forced;
    }
    out
}

#[async_trait]
impl MailProvider for GmailAliasProvider {
    fn id(&self) -> &'static str {
        PROVIDER_ID
    }

    fn is_configured(&self) -> bool {
        self.config
            .base_address
            .as_deref()
            .map(|base| base.contains('@'))
            .unwrap_or(false)
    }

    fn can_auto_verify(&self) -> bool {
        false
    }

    async fn create_inbox(&self, identity: &Identity) -> MailResult<Inbox> {
        let address = self.alias(identity, &mut rand::thread_rng())?;
        Ok(Inbox {
            address,
            provider: PROVIDER_ID.to_string(),
            handle: None,
        })
    }

    async fn fetch_verification_code(
        &self,
        _inbox: &Inbox,
        _query: &CodeQuery,
    ) -> MailResult<Option<String>> {
        Err(MailError::AutoVerifyUnsupported(PROVIDER_ID.to_string()))
    }

    async fn release_inbox(&self, _inbox: &Inbox) -> MailResult<()> {
        Ok(())
    }
}
