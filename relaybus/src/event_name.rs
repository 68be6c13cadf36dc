use crate::Config;

/// Derives wire-level event names from event type names.
///
/// The configured prefix is stripped first, then the configured suffixes, each
/// as long as the name still carries them. With the default suffixes
/// `"OrderStartedEto"` and `"OrderStartedIntegrationEvent"` both become
/// `"OrderStarted"`. Applying the rules to an already stripped name is a no-op.
///
/// Stripping never empties a name: a type called exactly `"Eto"` keeps its
/// name.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventNaming {
    prefix: String,
    suffixes: Vec<String>,
}

impl EventNaming {
    pub fn new<S>(prefix: impl Into<String>, suffixes: impl IntoIterator<Item = S>) -> Self
    where
        S: Into<String>,
    {
        let mut suffixes: Vec<String> = suffixes
            .into_iter()
            .map(Into::into)
            .filter(|s| !s.is_empty())
            .collect();
        // longest first, so "IntegrationEvent" wins over "Event"
        suffixes.sort_by(|a, b| b.len().cmp(&a.len()));
        Self {
            prefix: prefix.into(),
            suffixes,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.event_name_prefix.clone(),
            config.event_name_suffixes.iter().cloned(),
        )
    }

    pub fn event_name(&self, type_name: &str) -> String {
        let name = self.strip_prefix(type_name);
        self.strip_suffix(name).to_string()
    }

    fn strip_prefix<'a>(&self, mut name: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            return name;
        }
        while let Some(rest) = name.strip_prefix(self.prefix.as_str()) {
            if rest.is_empty() {
                break;
            }
            name = rest;
        }
        name
    }

    fn strip_suffix<'a>(&self, mut name: &'a str) -> &'a str {
        while let Some(rest) = self
            .suffixes
            .iter()
            .find_map(move |suffix| name.strip_suffix(suffix.as_str()).filter(|rest| !rest.is_empty()))
        {
            name = rest;
        }
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naming() -> EventNaming {
        EventNaming::new("", ["IntegrationEvent", "Eto"])
    }

    #[test]
    fn test_strips_default_suffixes() {
        let naming = naming();
        assert_eq!(naming.event_name("OrderStartedEto"), "OrderStarted");
        assert_eq!(naming.event_name("OrderStartedIntegrationEvent"), "OrderStarted");
        assert_eq!(naming.event_name("OrderStarted"), "OrderStarted");
    }

    #[test]
    fn test_strips_stacked_suffixes() {
        assert_eq!(naming().event_name("PaymentEtoEto"), "Payment");
        assert_eq!(naming().event_name("PaymentEtoIntegrationEvent"), "Payment");
    }

    #[test]
    fn test_prefix_then_suffix() {
        let naming = EventNaming::new("Shop", ["Eto"]);
        assert_eq!(naming.event_name("ShopOrderStartedEto"), "OrderStarted");
        assert_eq!(naming.event_name("OrderStartedEto"), "OrderStarted");
    }

    #[test]
    fn test_longest_suffix_wins() {
        let naming = EventNaming::new("", ["Event", "IntegrationEvent"]);
        assert_eq!(naming.event_name("OrderStartedIntegrationEvent"), "OrderStarted");
    }

    #[test]
    fn test_never_produces_empty_name() {
        let naming = EventNaming::new("Eto", ["Eto"]);
        assert_eq!(naming.event_name("Eto"), "Eto");
    }

    #[test]
    fn test_deterministic_and_idempotent() {
        let naming = naming();
        for type_name in [
            "OrderStartedEto",
            "ShipmentStartedIntegrationEvent",
            "Refunded",
            "EtoEto",
            "RefundEtoEto",
        ] {
            let once = naming.event_name(type_name);
            assert_eq!(once, naming.event_name(type_name));
            assert_eq!(naming.event_name(&once), once);
        }
    }
}
