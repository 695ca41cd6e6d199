//! Build context rendering.
//!
//! Each fingerprint gets its own build directory holding a `Dockerfile`, rendered from
//! the base's template, and a `preload.txt` listing the modules the pod imports at start.
//! Templates are embedded in the binary; a template directory from the configuration
//! takes precedence when it holds a file with the same name. The `podfleet-pod` binary
//! is copied next to them so the image can run it as its entrypoint.

use log::{debug, info, warn};
use rust_embed::RustEmbed;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error_handling::types::FleetError;
use crate::fleet_management::types::{Base, Fingerprint};

const PLACEHOLDER: &str = "{{PKG_DEPENDENCIES}}";
pub const POD_BINARY_NAME: &str = "podfleet-pod";

#[derive(RustEmbed)]
#[folder = "$CARGO_MANIFEST_DIR/templates/"]
struct Templates;

pub struct BuildContext {
    template_dir: Option<PathBuf>,
    pod_binary: Option<PathBuf>,
}

impl BuildContext {
    pub fn new(template_dir: Option<PathBuf>) -> Self {
        Self {
            template_dir,
            pod_binary: None,
        }
    }

    /// Copies `path` into every build context as the pod entrypoint.
    pub fn with_pod_binary(mut self, path: PathBuf) -> Self {
        self.pod_binary = Some(path);
        self
    }

    fn template_name(base: Base) -> &'static str {
        match base {
            Base::Python => "Dockerfile_python",
            Base::Pytorch => "Dockerfile_pytorch",
            Base::Js => "Dockerfile_js",
        }
    }

    fn load_template(&self, base: Base) -> Result<String, FleetError> {
        let name = Self::template_name(base);

        if let Some(dir) = &self.template_dir {
            let path = dir.join(name);
            if path.is_file() {
                debug!("Using template override {}", path.display());
                return Ok(fs::read_to_string(&path)?);
            }
        }

        let file = Templates::get(name)
            .ok_or_else(|| FleetError::TemplateError(format!("no template named {}", name)))?;
        String::from_utf8(file.data.into_owned())
            .map_err(|e| FleetError::TemplateError(format!("{} is not UTF-8: {}", name, e)))
    }

    /// Renders the Dockerfile for `fingerprint`: one install line per dependency.
    pub fn render_dockerfile(&self, fingerprint: &Fingerprint) -> Result<String, FleetError> {
        let template = self.load_template(fingerprint.base())?;
        if !template.contains(PLACEHOLDER) {
            return Err(FleetError::TemplateError(format!(
                "{} lacks the {} placeholder",
                Self::template_name(fingerprint.base()),
                PLACEHOLDER
            )));
        }

        let installer = match fingerprint.base() {
            Base::Python | Base::Pytorch => "pip install",
            Base::Js => "npm install",
        };
        let installs = fingerprint
            .dependencies()
            .map(|dep| format!("RUN {} {}", installer, dep.package))
            .collect::<Vec<_>>()
            .join("\n");

        Ok(template.replace(PLACEHOLDER, &installs))
    }

    /// Names the pod preloads at start, sorted and deduplicated.
    pub fn preload_names(fingerprint: &Fingerprint) -> Vec<String> {
        let mut names: BTreeSet<String> = match fingerprint.base() {
            Base::Js => fingerprint.dependencies().map(|d| d.package.clone()).collect(),
            Base::Python | Base::Pytorch => fingerprint
                .dependencies()
                .map(|d| d.import.replace('-', "_"))
                .collect(),
        };
        if fingerprint.base() == Base::Pytorch {
            names.insert("torch".to_string());
        }
        names.into_iter().collect()
    }

    /// Writes the full build context for `fingerprint` into `dir`, creating it if needed.
    pub fn write(&self, fingerprint: &Fingerprint, dir: &Path) -> Result<(), FleetError> {
        let dockerfile = self.render_dockerfile(fingerprint)?;
        let mut preload = Self::preload_names(fingerprint).join("\n");
        preload.push('\n');

        fs::create_dir_all(dir)?;
        fs::write(dir.join("Dockerfile"), dockerfile)?;
        fs::write(dir.join("preload.txt"), preload)?;
        match &self.pod_binary {
            Some(binary) => {
                fs::copy(binary, dir.join(POD_BINARY_NAME)).map_err(|e| {
                    FleetError::TemplateError(format!(
                        "unable to copy {} into the build context: {}",
                        binary.display(),
                        e
                    ))
                })?;
            }
            None => warn!(
                "No {} binary configured, the image build will fail unless the template provides one",
                POD_BINARY_NAME
            ),
        }
        info!("Wrote build context for {} to {}", fingerprint, dir.display());
        Ok(())
    }
}

impl Default for BuildContext {
    fn default() -> Self {
        Self::new(None)
    }
}
