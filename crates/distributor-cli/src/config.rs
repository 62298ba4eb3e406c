use distributor_lib::DistributorConfig;

/// Read the config from `path`, or stdin when it is `-`.
///
/// A missing or invalid file is logged and replaced by the default config.
/// Environment overrides are applied last.
pub fn get_config(path: Option<&str>) -> DistributorConfig {
    let mut config = match path {
        Some(s) => if s == "-" {
            use std::io::Read;
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .map_err(|error| {
                    tracing::error!("Error reading STDIN: {}", error);
                })
                .map(move |_| buf)
        } else {
            std::fs::read_to_string(s).map_err(|error| {
                tracing::error!("Error reading config: {}", error);
            })
        }
        .and_then(|s| {
            parse(&s).map_err(|error| {
                tracing::error!("Error parsing config: {}", error);
            })
        })
        .map_err(|_| {
            tracing::warn!("Invalid config file, using default");
        })
        .unwrap_or_default(),
        None => {
            tracing::info!("No config specified, using default");
            DistributorConfig::default()
        }
    };
    config.apply_env();
    config
}

pub fn parse(s: &str) -> Result<DistributorConfig, toml::de::Error> {
    toml::from_str(s)
}
