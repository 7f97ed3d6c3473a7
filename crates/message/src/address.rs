use serde::{Deserialize, Serialize};

/// An envelope address: either the null sender, or `local_part@domain`.
/// Stored as the string form; the accessors crack it apart on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Eq)]
#[serde(transparent)]
pub struct EnvelopeAddress(String);

impl EnvelopeAddress {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        if text.is_empty() {
            Ok(Self::null_sender())
        } else {
            let fields: Vec<&str> = text.split('@').collect();
            anyhow::ensure!(fields.len() == 2, "expected user@domain, got '{text}'");
            anyhow::ensure!(
                !fields[0].is_empty() && !fields[1].is_empty(),
                "expected user@domain, got '{text}'"
            );
            Ok(Self(text.to_string()))
        }
    }

    pub fn user(&self) -> &str {
        match self.0.rfind('@') {
            Some(at) => &self.0[..at],
            None => "",
        }
    }

    pub fn domain(&self) -> &str {
        match self.0.rfind('@') {
            Some(at) => &self.0[at + 1..],
            None => "",
        }
    }

    pub fn null_sender() -> Self {
        Self(String::new())
    }

    pub fn is_null_sender(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for EnvelopeAddress {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.0.fmt(fmt)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse() {
        let addr = EnvelopeAddress::parse("user@example.com").unwrap();
        assert_eq!(addr.user(), "user");
        assert_eq!(addr.domain(), "example.com");

        let null = EnvelopeAddress::parse("").unwrap();
        assert!(null.is_null_sender());
        assert_eq!(null.user(), "");
        assert_eq!(null.domain(), "");

        assert!(EnvelopeAddress::parse("no-domain").is_err());
        assert!(EnvelopeAddress::parse("@example.com").is_err());
    }
}
