use super::models::PartyPostalAddress;
use crate::config::NormalizationRules;

/// Canonicalizes identity signals so near-duplicates share one key.
#[derive(Debug, Clone)]
pub struct Normalizer {
    rules: NormalizationRules,
}

impl Normalizer {
    pub fn new(rules: NormalizationRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &NormalizationRules {
        &self.rules
    }

    pub fn name_key(&self, name: &str) -> String {
        let cased = self.case(name.trim());
        if self.rules.strip_non_alphanumeric_names {
            cased.chars().filter(|c| c.is_alphanumeric()).collect()
        } else {
            cased.split_whitespace().collect::<Vec<_>>().join(" ")
        }
    }

    /// Country code, postal code and street residue, concatenated.
    /// Addresses without a street line produce no key.
    pub fn address_key(&self, address: &PartyPostalAddress) -> Option<String> {
        let street = address.address1.as_deref().map(str::trim).unwrap_or("");
        let street = self.street_key(street);
        if street.is_empty() {
            return None;
        }

        let country = compact(&self.case(address.country_code.as_deref().unwrap_or("")));
        let postal = compact(&self.case(address.postal_code.as_deref().unwrap_or("")));
        Some(format!("{country}{postal}{street}"))
    }

    pub fn email_key(&self, email: &str) -> Option<String> {
        let email = if self.rules.strip_email_whitespace {
            compact(email)
        } else {
            email.trim().to_string()
        };
        if email.is_empty() {
            return None;
        }
        Some(self.case(&email))
    }

    fn street_key(&self, street: &str) -> String {
        let tokens: Vec<String> = if self.rules.strip_non_alphanumeric_addresses {
            street
                .split(|c: char| !c.is_alphanumeric())
                .filter(|token| !token.is_empty())
                .map(|token| self.abbreviate(token))
                .collect()
        } else {
            street.split_whitespace().map(|token| self.abbreviate(token)).collect()
        };

        if self.rules.strip_non_alphanumeric_addresses {
            tokens.concat()
        } else {
            tokens.join(" ")
        }
    }

    fn abbreviate(&self, token: &str) -> String {
        match self.rules.address_abbreviations.get(&token.to_uppercase()) {
            Some(short) => self.case(short),
            None => self.case(token),
        }
    }

    fn case(&self, value: &str) -> String {
        if self.rules.upper_case {
            value.to_uppercase()
        } else {
            value.to_string()
        }
    }
}

fn compact(value: &str) -> String {
    value.chars().filter(|c| !c.is_whitespace()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(line: &str, postal: &str, country: &str) -> PartyPostalAddress {
        PartyPostalAddress {
            party_id: "P1".to_string(),
            contact_mech_id: "CM1".to_string(),
            address1: Some(line.to_string()),
            postal_code: Some(postal.to_string()),
            country_code: Some(country.to_string()),
        }
    }

    #[test]
    fn test_street_variants_share_a_key() {
        let normalizer = Normalizer::new(NormalizationRules::default());
        let a = normalizer.address_key(&address("123 Main St", "94107", "US"));
        let b = normalizer.address_key(&address("123 MAIN STREET", "94107", "US"));

        assert_eq!(a, Some("US94107123MAINST".to_string()));
        assert_eq!(a, b);
    }

    #[test]
    fn test_postal_code_separates_addresses() {
        let normalizer = Normalizer::new(NormalizationRules::default());
        assert_ne!(
            normalizer.address_key(&address("123 Main St", "94107", "US")),
            normalizer.address_key(&address("123 Main St", "94110", "US"))
        );
    }

    #[test]
    fn test_missing_street_has_no_key() {
        let normalizer = Normalizer::new(NormalizationRules::default());
        assert_eq!(normalizer.address_key(&address("  ,. ", "94107", "US")), None);

        let mut no_line = address("", "94107", "US");
        no_line.address1 = None;
        assert_eq!(normalizer.address_key(&no_line), None);
    }

    #[test]
    fn test_without_abbreviations_full_words_differ() {
        let rules = NormalizationRules {
            address_abbreviations: Default::default(),
            ..NormalizationRules::default()
        };
        let normalizer = Normalizer::new(rules);
        assert_ne!(
            normalizer.address_key(&address("123 Main St", "94107", "US")),
            normalizer.address_key(&address("123 Main Street", "94107", "US"))
        );
    }

    #[test]
    fn test_email_key_upper_cases_and_strips_whitespace() {
        let normalizer = Normalizer::new(NormalizationRules::default());
        assert_eq!(
            normalizer.email_key(" Jane.Doe @Example.com "),
            Some("JANE.DOE@EXAMPLE.COM".to_string())
        );
        assert_eq!(normalizer.email_key("   "), None);
    }

    #[test]
    fn test_name_key_is_exact_after_normalization() {
        let normalizer = Normalizer::new(NormalizationRules::default());
        assert_eq!(normalizer.name_key("Acme, Inc."), normalizer.name_key("ACME INC"));
        assert_ne!(normalizer.name_key("Acme Inc"), normalizer.name_key("Acme Corp"));
    }

    #[test]
    fn test_name_key_keeps_punctuation_when_configured() {
        let rules = NormalizationRules {
            strip_non_alphanumeric_names: false,
            ..NormalizationRules::default()
        };
        let normalizer = Normalizer::new(rules);
        assert_eq!(normalizer.name_key(" o'brien   ltd "), "O'BRIEN LTD");
    }
}
