use crate::{Params, ProtocolError};

/// Parameters of a START_DAEMON request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartDaemonParams {
    pub daemon_language: String,
    pub daemon_language_version: Option<String>,
    pub storlet_path: String,
    pub storlet_name: String,
    pub pool_size: usize,
    pub uds_path: String,
    pub log_level: String,
}

impl StartDaemonParams {
    pub fn from_params(params: &Params) -> Result<Self, ProtocolError> {
        let pool_size = required(params, "pool_size")?;
        Ok(StartDaemonParams {
            daemon_language: params
                .get("daemon_language")
                .cloned()
                .unwrap_or_else(|| "java".to_string()),
            daemon_language_version: params.get("daemon_language_version").cloned(),
            storlet_path: required(params, "storlet_path")?.to_string(),
            storlet_name: required(params, "storlet_name")?.to_string(),
            pool_size: match pool_size.parse() {
                Ok(size) if size > 0 => size,
                _ => {
                    return Err(ProtocolError::InvalidParam {
                        name: "pool_size",
                        value: pool_size.to_string(),
                    })
                }
            },
            uds_path: required(params, "uds_path")?.to_string(),
            log_level: required(params, "log_level")?.to_string(),
        })
    }

    pub fn to_params(&self) -> Params {
        let mut params = Params::new();
        params.insert("daemon_language".into(), self.daemon_language.clone());
        if let Some(version) = &self.daemon_language_version {
            params.insert("daemon_language_version".into(), version.clone());
        }
        params.insert("storlet_path".into(), self.storlet_path.clone());
        params.insert("storlet_name".into(), self.storlet_name.clone());
        params.insert("pool_size".into(), self.pool_size.to_string());
        params.insert("uds_path".into(), self.uds_path.clone());
        params.insert("log_level".into(), self.log_level.clone());
        params
    }
}

fn required<'a>(params: &'a Params, name: &'static str) -> Result<&'a str, ProtocolError> {
    params
        .get(name)
        .map(String::as_str)
        .ok_or(ProtocolError::MissingParam(name))
}
