use std::fmt::Write as _;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use super::types::{
    check_port_unique, EndpointSpec, GeneratedConfigArtifact, TunnelMode, TunnelServerConfig,
};
use crate::error::ConfigError;

pub struct FRPConfigGenerator {
    config_dir: PathBuf,
    config_file_name: String,
    mode: TunnelMode,
}

impl FRPConfigGenerator {
    pub fn new(config_dir: PathBuf, config_file_name: impl Into<String>, mode: TunnelMode) -> Self {
        Self {
            config_dir,
            config_file_name: config_file_name.into(),
            mode,
        }
    }

    /// Render the agent config in memory. Same inputs always give the same bytes.
    pub fn build(
        &self,
        server: Option<&TunnelServerConfig>,
        endpoints: &[EndpointSpec],
    ) -> Result<GeneratedConfigArtifact, ConfigError> {
        let server = server.ok_or(ConfigError::MissingServerConfig)?;
        server
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let mut enabled: Vec<&EndpointSpec> = endpoints.iter().filter(|e| e.enabled).collect();
        if enabled.is_empty() {
            return Err(ConfigError::NoEnabledEndpoints);
        }
        if self.mode == TunnelMode::Single {
            enabled.truncate(1);
        }

        let mut seen: Vec<EndpointSpec> = Vec::with_capacity(enabled.len());
        for endpoint in &enabled {
            endpoint
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("{}: {}", endpoint.id, e)))?;
            check_port_unique(endpoint.remote_port, &seen, None)
                .map_err(|e| ConfigError::Invalid(format!("{}: {}", endpoint.id, e)))?;
            if seen.iter().any(|s| s.id == endpoint.id) {
                return Err(ConfigError::Invalid(format!("duplicate endpoint id: {}", endpoint.id)));
            }
            seen.push((*endpoint).clone());
        }

        let mut config = format!(
            "[common]\n\
             server_addr = {}\n\
             server_port = {}\n\
             token = {}\n\
             \n",
            server.server_addr, server.server_port, server.auth_token
        );

        let mut sections = Vec::with_capacity(enabled.len());
        for endpoint in enabled {
            // Writing into a String cannot fail
            let _ = write!(
                config,
                "[{}]\n\
                 type = tcp\n\
                 local_ip = {}\n\
                 local_port = {}\n\
                 remote_port = {}\n\
                 \n",
                endpoint.id,
                endpoint.local_host.trim(),
                endpoint.local_port,
                endpoint.remote_port
            );
            sections.push(endpoint.id.clone());
        }

        Ok(GeneratedConfigArtifact::new(config, sections))
    }

    /// Write a fully built artifact; readers see the old file or the new one, never a mix.
    pub fn write(&self, artifact: &GeneratedConfigArtifact) -> Result<PathBuf, ConfigError> {
        let config_path = self.get_config_path();
        write_atomically(&config_path, artifact.as_bytes())
            .map_err(|e| ConfigError::Write(format!("{:?}: {}", config_path, e)))?;

        log::info!("Config generated: {:?}", config_path);
        Ok(config_path)
    }

    pub fn generate_config(
        &self,
        server: Option<&TunnelServerConfig>,
        endpoints: &[EndpointSpec],
    ) -> Result<PathBuf, ConfigError> {
        let artifact = self.build(server, endpoints)?;
        self.write(&artifact)
    }

    pub fn get_config_path(&self) -> PathBuf {
        self.config_dir.join(&self.config_file_name)
    }
}

pub(crate) fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> TunnelServerConfig {
        TunnelServerConfig::new("relay.example.com", 7000, "s3cret")
    }

    fn generator(dir: &Path, mode: TunnelMode) -> FRPConfigGenerator {
        FRPConfigGenerator::new(dir.to_path_buf(), "frpc.ini", mode)
    }

    #[test]
    fn test_single_endpoint_block() {
        let dir = tempfile::tempdir().unwrap();
        let front = EndpointSpec::new("front", "192.168.1.10", 554, 557);

        let artifact = generator(dir.path(), TunnelMode::Multi)
            .build(Some(&server()), &[front])
            .unwrap();
        let text = artifact.as_str();

        assert_eq!(text.matches("[front]").count(), 1);
        assert!(text.contains("local_port = 554\n"));
        assert!(text.contains("remote_port = 557\n"));
        assert!(text.contains("local_ip = 192.168.1.10\n"));
        assert!(text.starts_with(
            "[common]\nserver_addr = relay.example.com\nserver_port = 7000\ntoken = s3cret\n\n"
        ));
        assert_eq!(artifact.endpoint_sections(), &["front".to_string()]);
    }

    #[test]
    fn test_build_is_deterministic_and_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let endpoints = vec![
            EndpointSpec::new("yard", "192.168.1.12", 554, 600),
            EndpointSpec::new("door", "192.168.1.11", 8554, 601),
        ];
        let gen = generator(dir.path(), TunnelMode::Multi);

        let first = gen.build(Some(&server()), &endpoints).unwrap();
        let second = gen.build(Some(&server()), &endpoints).unwrap();
        assert_eq!(first.as_bytes(), second.as_bytes());

        let yard = first.as_str().find("[yard]").unwrap();
        let door = first.as_str().find("[door]").unwrap();
        assert!(yard < door);
    }

    #[test]
    fn test_disabled_endpoints_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut off = EndpointSpec::new("off", "192.168.1.20", 554, 700);
        off.enabled = false;
        let on = EndpointSpec::new("on", "192.168.1.21", 554, 701);

        let artifact = generator(dir.path(), TunnelMode::Multi)
            .build(Some(&server()), &[off.clone(), on])
            .unwrap();
        assert!(!artifact.as_str().contains("[off]"));
        assert!(artifact.as_str().contains("[on]"));

        let err = generator(dir.path(), TunnelMode::Multi)
            .build(Some(&server()), &[off])
            .unwrap_err();
        assert_eq!(err, ConfigError::NoEnabledEndpoints);
    }

    #[test]
    fn test_missing_server_config() {
        let dir = tempfile::tempdir().unwrap();
        let err = generator(dir.path(), TunnelMode::Multi)
            .build(None, &[EndpointSpec::new("front", "192.168.1.10", 554, 557)])
            .unwrap_err();
        assert_eq!(err, ConfigError::MissingServerConfig);
        assert_eq!(err.to_string(), "missing server config");
    }

    #[test]
    fn test_server_address_with_newlines_is_not_rendered() {
        let dir = tempfile::tempdir().unwrap();
        let server = TunnelServerConfig {
            server_addr: "relay.example.com\n[evil]\ntype = tcp\nlocal_port = 22".to_string(),
            server_port: 7000,
            auth_token: "s3cret".to_string(),
        };
        let err = generator(dir.path(), TunnelMode::Multi)
            .build(Some(&server), &[EndpointSpec::new("front", "192.168.1.10", 554, 557)])
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_single_mode_keeps_first_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let endpoints = vec![
            EndpointSpec::new("a", "192.168.1.2", 554, 600),
            EndpointSpec::new("b", "192.168.1.3", 554, 601),
        ];
        let artifact = generator(dir.path(), TunnelMode::Single)
            .build(Some(&server()), &endpoints)
            .unwrap();
        assert_eq!(artifact.endpoint_sections(), &["a".to_string()]);
        assert!(!artifact.as_str().contains("[b]"));
    }

    #[test]
    fn test_duplicate_remote_ports_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let endpoints = vec![
            EndpointSpec::new("a", "192.168.1.2", 554, 600),
            EndpointSpec::new("b", "192.168.1.3", 554, 600),
        ];
        let err = generator(dir.path(), TunnelMode::Multi)
            .build(Some(&server()), &endpoints)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_write_replaces_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let gen = generator(&dir.path().join("nested"), TunnelMode::Multi);
        std::fs::create_dir_all(dir.path().join("nested")).unwrap();
        std::fs::write(gen.get_config_path(), "stale contents that are much longer than needed").unwrap();

        let path = gen
            .generate_config(Some(&server()), &[EndpointSpec::new("front", "192.168.1.10", 554, 557)])
            .unwrap();
        let written = std::fs::read_to_string(path).unwrap();
        assert!(written.starts_with("[common]\n"));
        assert!(!written.contains("stale"));
    }
}
