//! Configuration struct parsing helper.

/// Composes a configuration struct from its default values, then overwrites
/// the listed fields by parsing from the given TOML string if it is not
/// `None`. Returns `Ok(config)` on success, and `Err(ChatError)` on parser
/// failure or on any key that is not among the listed fields.
///
/// Example:
/// ```ignore
/// let config = parsed_config!(config_str => MyConfig; history_depth, hist_dir)?;
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        let compose_config = || -> Result<$config_type, $crate::ChatError> {
            let mut config: $config_type = Default::default();
            let Some(config_str) = config_str else {
                return Ok(config);
            };

            let mut table = config_str.parse::<toml::Table>()?;
            $({
                if let Some(v) = table.remove(stringify!($field)) {
                    config.$field = v.try_into()?;
                }
            })+

            // leftover keys are not recognized
            if let Some(key) = table.keys().next() {
                return Err($crate::ChatError::msg(format!(
                    "invalid field name '{}' in config",
                    key
                )));
            }

            Ok(config)
        };

        compose_config()
    }};
}

#[cfg(test)]
mod tests {
    use crate::utils::ChatError;

    #[derive(Debug, PartialEq)]
    struct TestConfig {
        depth: usize,
        dir: String,
        retries: u8,
    }

    impl Default for TestConfig {
        fn default() -> Self {
            TestConfig {
                depth: 10,
                dir: "/tmp/replichat".into(),
                retries: 3,
            }
        }
    }

    #[test]
    fn parse_from_none() -> Result<(), ChatError> {
        let config = parsed_config!(None => TestConfig; depth, dir, retries)?;
        assert_eq!(config, TestConfig::default());
        Ok(())
    }

    #[test]
    fn parse_from_partial() -> Result<(), ChatError> {
        let config_str = Some("dir = '/tmp/other'\nretries = 7");
        let config = parsed_config!(config_str => TestConfig; dir, retries)?;
        let ref_config = TestConfig {
            depth: 10,
            dir: "/tmp/other".into(),
            retries: 7,
        };
        assert_eq!(config, ref_config);
        Ok(())
    }

    #[test]
    fn parse_invalid_field() {
        let config_str = Some("xyz = 999");
        assert!(parsed_config!(config_str => TestConfig; depth).is_err());
    }

    #[test]
    fn parse_wrong_type() {
        let config_str = Some("retries = 'many'");
        assert!(parsed_config!(config_str => TestConfig; retries).is_err());
    }
}
