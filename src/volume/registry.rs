//! Volume Plugin Registry
//!
//! Holds every plugin known to this process. Plugins are registered once at
//! startup through [`VolumePluginRegistry::init`]; the registry is immutable
//! afterwards and shared as `Arc<VolumePluginRegistry>`.

use super::{VolumeHostRef, VolumePluginRef, VolumeSpec};
use crate::domain::ports::VolumeProvisionerRef;
use crate::error::{Error, Result};
use crate::validation::is_qualified_name;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Registry of initialized volume plugins keyed by name
pub struct VolumePluginRegistry {
    plugins: BTreeMap<String, VolumePluginRef>,
}

#[cfg(test)]
impl std::fmt::Debug for VolumePluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumePluginRegistry")
            .field("plugins", &self.plugins.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl VolumePluginRegistry {
    /// Validate, initialize and register `plugins`
    ///
    /// Fails on the first plugin with an invalid or duplicate name, or whose
    /// `init` fails.
    pub fn init(plugins: Vec<VolumePluginRef>, host: VolumeHostRef) -> Result<Arc<Self>> {
        let mut registered: BTreeMap<String, VolumePluginRef> = BTreeMap::new();

        for plugin in plugins {
            let name = plugin.name().to_string();
            let problems = is_qualified_name(&name);
            if !problems.is_empty() {
                return Err(Error::PluginRegistration {
                    plugin: name,
                    reason: problems.join("; "),
                });
            }
            if registered.contains_key(&name) {
                return Err(Error::PluginRegistration {
                    plugin: name,
                    reason: "volume plugin registered more than once".into(),
                });
            }

            plugin.init(host.clone()).map_err(|e| Error::PluginRegistration {
                plugin: name.clone(),
                reason: e.to_string(),
            })?;
            info!("Loaded volume plugin {:?}", name);
            registered.insert(name, plugin);
        }

        Ok(Arc::new(Self {
            plugins: registered,
        }))
    }

    /// The single plugin that supports `spec`
    pub fn find_plugin_by_spec(&self, spec: &VolumeSpec) -> Result<VolumePluginRef> {
        let matches: Vec<&VolumePluginRef> = self
            .plugins
            .values()
            .filter(|p| p.can_support(spec))
            .collect();

        match matches.as_slice() {
            [] => Err(Error::PluginNotFound(format!(
                "no volume plugin supports volume {:?}",
                spec.name()
            ))),
            [plugin] => {
                debug!("Volume {:?} handled by plugin {}", spec.name(), plugin.name());
                Ok(Arc::clone(*plugin))
            }
            many => Err(Error::MultiplePluginsMatched {
                names: many.iter().map(|p| p.name().to_string()).collect(),
            }),
        }
    }

    /// The plugin registered as `name`
    pub fn find_plugin_by_name(&self, name: &str) -> Result<VolumePluginRef> {
        self.plugins
            .get(name)
            .cloned()
            .ok_or_else(|| Error::PluginNotFound(format!("no volume plugin named {:?}", name)))
    }

    /// The provisioner of the plugin registered as `name`
    pub fn find_provisionable_plugin_by_name(&self, name: &str) -> Result<VolumeProvisionerRef> {
        self.plugins
            .get(name)
            .cloned()
            .and_then(|p| p.as_provisioner())
            .ok_or_else(|| Error::ProvisionerNotFound {
                provisioner: name.to_string(),
            })
    }

    /// Names of all registered plugins, sorted
    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_host, FakePlugin, FakeProvisionablePlugin};
    use assert_matches::assert_matches;
    use k8s_openapi::api::core::v1::Volume;

    fn spec(name: &str) -> VolumeSpec {
        VolumeSpec::from_volume(Volume {
            name: name.into(),
            ..Default::default()
        })
    }

    #[test]
    fn test_init_rejects_duplicates_and_bad_names() {
        let (host, _dir) = test_host();
        let err = VolumePluginRegistry::init(
            vec![
                Arc::new(FakePlugin::new("example.com/fake")),
                Arc::new(FakePlugin::new("example.com/fake")),
            ],
            host.clone(),
        )
        .err()
        .unwrap();
        assert_matches!(err, Error::PluginRegistration { ref plugin, .. } if plugin == "example.com/fake");

        let err = VolumePluginRegistry::init(vec![Arc::new(FakePlugin::new("bad name!"))], host)
            .err()
            .unwrap();
        assert_matches!(err, Error::PluginRegistration { .. });
    }

    #[test]
    fn test_init_passes_host() {
        let (host, _dir) = test_host();
        let plugin = Arc::new(FakePlugin::new("example.com/fake"));
        let registry = VolumePluginRegistry::init(vec![plugin.clone()], host).unwrap();
        assert!(plugin.initialized());
        assert_eq!(registry.plugin_names(), vec!["example.com/fake"]);
    }

    #[test]
    fn test_find_plugin_by_spec() {
        let (host, _dir) = test_host();
        let registry = VolumePluginRegistry::init(
            vec![
                Arc::new(FakePlugin::new("example.com/a").supporting(&["one", "shared"])),
                Arc::new(FakePlugin::new("example.com/b").supporting(&["two", "shared"])),
            ],
            host,
        )
        .unwrap();

        assert_eq!(
            registry.find_plugin_by_spec(&spec("one")).unwrap().name(),
            "example.com/a"
        );
        assert_matches!(
            registry.find_plugin_by_spec(&spec("none")),
            Err(Error::PluginNotFound(_))
        );
        assert_matches!(
            registry.find_plugin_by_spec(&spec("shared")),
            Err(Error::MultiplePluginsMatched { names }) if names == vec!["example.com/a", "example.com/b"]
        );
    }

    #[test]
    fn test_find_provisionable_plugin() {
        let (host, _dir) = test_host();
        let registry = VolumePluginRegistry::init(
            vec![
                Arc::new(FakePlugin::new("example.com/plain")),
                Arc::new(FakeProvisionablePlugin::new("example.com/dynamic")),
            ],
            host,
        )
        .unwrap();

        let provisioner = registry
            .find_provisionable_plugin_by_name("example.com/dynamic")
            .unwrap();
        assert_eq!(provisioner.provisioner_name(), "example.com/dynamic");

        assert_matches!(
            registry.find_provisionable_plugin_by_name("example.com/plain"),
            Err(Error::ProvisionerNotFound { .. })
        );
        assert_matches!(
            registry.find_provisionable_plugin_by_name("example.com/missing"),
            Err(Error::ProvisionerNotFound { .. })
        );
        assert!(registry.find_plugin_by_name("example.com/plain").is_ok());
    }
}
