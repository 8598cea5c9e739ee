//! Settings shared by the director and the envoys.

use std::fmt;

use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use tracing_subscriber::filter::EnvFilter;

#[derive(Debug, Deserialize)]
/// Logging settings, read from the `[log]` section of a configuration file.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info,fedflow_director=debug"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDFLOW_LOG__FILTER=info
    /// FEDFLOW_ENVOY_LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.3/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a comma-separated list of tracing filter directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directives() {
        let settings: LoggingSettings =
            serde_json::from_str(r#"{"filter": "info,fedflow_core=trace"}"#).unwrap();
        assert!(settings.filter.to_string().contains("fedflow_core=trace"));

        let err = serde_json::from_str::<LoggingSettings>(r#"{"filter": "fedflow_core=loud"}"#)
            .unwrap_err();
        assert!(err.to_string().contains("tracing filter directives"));
        assert!(serde_json::from_str::<LoggingSettings>(r#"{"filter": 3}"#).is_err());
    }
}
