//! Compiled contract artifacts and ABI encoding.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use alloy_core::{
    dyn_abi::{DynSolValue, JsonAbiExt, Specifier},
    json_abi::{Function, JsonAbi, Param},
    primitives::Bytes,
};
use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::ConfigurationError;

/// Where the source of an artifact can be found, for explorer verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRef {
    pub contract_name: String,
    pub source_name: Option<String>,
    /// Hardhat build-info file holding the compiler version and standard-JSON input.
    pub build_info: Option<PathBuf>,
}

impl SourceRef {
    /// `path/to/Source.sol:Contract`, or just the contract name when the source is unknown.
    pub fn fully_qualified_name(&self) -> String {
        match &self.source_name {
            Some(source) => format!("{}:{}", source, self.contract_name),
            None => self.contract_name.clone(),
        }
    }
}

/// A compiled contract: creation bytecode and ABI.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub contract_name: String,
    pub source_name: Option<String>,
    pub abi: JsonAbi,
    pub bytecode: Bytes,
    pub build_info: Option<PathBuf>,
}

impl Artifact {
    pub fn new(contract_name: impl Into<String>, abi: JsonAbi, bytecode: Bytes) -> Self {
        Self {
            contract_name: contract_name.into(),
            source_name: None,
            abi,
            bytecode,
            build_info: None,
        }
    }

    pub fn source_ref(&self) -> SourceRef {
        SourceRef {
            contract_name: self.contract_name.clone(),
            source_name: self.source_name.clone(),
            build_info: self.build_info.clone(),
        }
    }

    /// ABI-encode constructor arguments, without the creation bytecode.
    pub fn encode_constructor_args(&self, args: &[String]) -> Result<Bytes, ConfigurationError> {
        let context = format!("{} constructor", self.contract_name);
        let Some(constructor) = &self.abi.constructor else {
            if !args.is_empty() {
                return Err(ConfigurationError::ArgumentCount {
                    context,
                    expected: 0,
                    actual: args.len(),
                });
            }
            return Ok(Bytes::new());
        };

        let values = coerce_args(&context, &constructor.inputs, args)?;
        constructor
            .abi_encode_input(&values)
            .map(Bytes::from)
            .map_err(|e| encoding_error(&context, &constructor.inputs, args, e))
    }

    /// Creation bytecode followed by the encoded constructor arguments.
    pub fn encode_deploy(&self, args: &[String]) -> Result<Bytes, ConfigurationError> {
        let encoded_args = self.encode_constructor_args(args)?;
        let mut data = self.bytecode.to_vec();
        data.extend_from_slice(&encoded_args);
        Ok(data.into())
    }

    /// Creation bytecode followed by already typed constructor arguments.
    pub fn encode_deploy_values(&self, values: &[DynSolValue]) -> Result<Bytes, ConfigurationError> {
        let context = format!("{} constructor", self.contract_name);
        let inputs = self
            .abi
            .constructor
            .as_ref()
            .map(|c| c.inputs.as_slice())
            .unwrap_or_default();
        if inputs.len() != values.len() {
            return Err(ConfigurationError::ArgumentCount {
                context,
                expected: inputs.len(),
                actual: values.len(),
            });
        }

        let mut data = self.bytecode.to_vec();
        if let Some(constructor) = &self.abi.constructor {
            let encoded = constructor
                .abi_encode_input(values)
                .map_err(|e| encoding_error(&context, inputs, &[], e))?;
            data.extend_from_slice(&encoded);
        }
        Ok(data.into())
    }

    /// Selector plus already typed arguments for a call to `method`.
    pub fn encode_call_values(
        &self,
        method: &str,
        values: &[DynSolValue],
    ) -> Result<Bytes, ConfigurationError> {
        let function = self.function(method, values.len())?;
        let context = format!("{}.{}", self.contract_name, function.signature());
        function
            .abi_encode_input(values)
            .map(Bytes::from)
            .map_err(|e| encoding_error(&context, &function.inputs, &[], e))
    }

    /// Find the unique function named `method` taking `arity` arguments.
    pub fn function(&self, method: &str, arity: usize) -> Result<&Function, ConfigurationError> {
        let mut candidates = self
            .abi
            .function(method)
            .into_iter()
            .flatten()
            .filter(|f| f.inputs.len() == arity);

        let function = candidates
            .next()
            .ok_or_else(|| ConfigurationError::UnknownMethod {
                contract: self.contract_name.clone(),
                method: method.to_string(),
                arity,
            })?;

        if candidates.next().is_some() {
            return Err(ConfigurationError::AmbiguousMethod {
                contract: self.contract_name.clone(),
                method: method.to_string(),
                arity,
            });
        }

        Ok(function)
    }

    /// Selector plus encoded arguments for a call to `method`.
    pub fn encode_call(&self, method: &str, args: &[String]) -> Result<Bytes, ConfigurationError> {
        let function = self.function(method, args.len())?;
        let context = format!("{}.{}", self.contract_name, function.signature());
        let values = coerce_args(&context, &function.inputs, args)?;
        function
            .abi_encode_input(&values)
            .map(Bytes::from)
            .map_err(|e| encoding_error(&context, &function.inputs, args, e))
    }

    /// Number of constructor inputs declared by the ABI.
    pub fn constructor_arity(&self) -> usize {
        self.abi
            .constructor
            .as_ref()
            .map_or(0, |c| c.inputs.len())
    }
}

/// Coerce textual arguments to the ABI types of `params`.
fn coerce_args(
    context: &str,
    params: &[Param],
    args: &[String],
) -> Result<Vec<DynSolValue>, ConfigurationError> {
    if params.len() != args.len() {
        return Err(ConfigurationError::ArgumentCount {
            context: context.to_string(),
            expected: params.len(),
            actual: args.len(),
        });
    }

    params
        .iter()
        .zip(args)
        .enumerate()
        .map(|(index, (param, arg))| {
            let invalid = |reason: String| ConfigurationError::InvalidArgument {
                context: context.to_string(),
                index,
                value: arg.clone(),
                ty: param.ty.clone(),
                reason,
            };
            let ty = param.resolve().map_err(|e| invalid(e.to_string()))?;
            ty.coerce_str(arg).map_err(|e| invalid(e.to_string()))
        })
        .collect()
}

fn encoding_error(
    context: &str,
    params: &[Param],
    args: &[String],
    error: impl std::fmt::Display,
) -> ConfigurationError {
    ConfigurationError::InvalidArgument {
        context: context.to_string(),
        index: 0,
        value: args.join(","),
        ty: params
            .iter()
            .map(|p| p.ty.as_str())
            .collect::<Vec<_>>()
            .join(","),
        reason: error.to_string(),
    }
}

/// Bytecode as emitted by Hardhat (`"0x..."`) or Foundry (`{ "object": "0x..." }`).
#[derive(Deserialize)]
#[serde(untagged)]
enum RawBytecode {
    Hex(Bytes),
    Object { object: Bytes },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawArtifact {
    contract_name: Option<String>,
    source_name: Option<String>,
    abi: JsonAbi,
    bytecode: RawBytecode,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DebugFile {
    build_info: PathBuf,
}

/// Lookup of artifacts by contract name.
#[derive(Debug, Clone, Default)]
pub struct ContractRegistry {
    artifacts: HashMap<String, Artifact>,
}

impl ContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_artifacts(artifacts: impl IntoIterator<Item = Artifact>) -> Self {
        let mut registry = Self::new();
        for artifact in artifacts {
            registry.insert(artifact);
        }
        registry
    }

    pub fn insert(&mut self, artifact: Artifact) {
        self.artifacts
            .insert(artifact.contract_name.clone(), artifact);
    }

    pub fn get_artifact(&self, name: &str) -> Result<&Artifact, ConfigurationError> {
        self.artifacts
            .get(name)
            .ok_or_else(|| ConfigurationError::UnknownContract(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.artifacts.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    /// Load every artifact under a Hardhat or Foundry output directory.
    ///
    /// `build-info` directories and `.dbg.json` files are not artifacts; a `.dbg.json`
    /// next to an artifact is followed to locate its build-info file. JSON files that
    /// do not look like artifacts (no `abi` or `bytecode`) are skipped.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            anyhow::bail!("Artifacts directory not found: {}", dir.display());
        }

        let mut registry = Self::new();
        let mut pending = vec![dir.to_path_buf()];

        while let Some(current) = pending.pop() {
            let entries = std::fs::read_dir(&current)
                .context(format!("Failed to read directory {}", current.display()))?;

            for entry in entries {
                let path = entry
                    .context(format!("Failed to read entry in {}", current.display()))?
                    .path();

                if path.is_dir() {
                    if path.file_name().is_some_and(|n| n != "build-info") {
                        pending.push(path);
                    }
                    continue;
                }

                let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if !file_name.ends_with(".json") || file_name.ends_with(".dbg.json") {
                    continue;
                }

                if let Some(artifact) = Self::load_artifact(&path)? {
                    if registry.contains(&artifact.contract_name) {
                        tracing::warn!(
                            contract = %artifact.contract_name,
                            path = %path.display(),
                            "Duplicate artifact name, keeping the last one loaded"
                        );
                    }
                    registry.insert(artifact);
                }
            }
        }

        tracing::debug!(
            path = %dir.display(),
            artifacts = registry.len(),
            "Artifacts loaded"
        );
        Ok(registry)
    }

    fn load_artifact(path: &Path) -> Result<Option<Artifact>> {
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read artifact {}", path.display()))?;

        let Ok(raw) = serde_json::from_str::<RawArtifact>(&content) else {
            tracing::trace!(path = %path.display(), "Skipping non-artifact JSON file");
            return Ok(None);
        };

        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        let contract_name = raw.contract_name.unwrap_or(stem.clone());

        let build_info = Self::locate_build_info(path, &stem)?;
        let bytecode = match raw.bytecode {
            RawBytecode::Hex(bytes) | RawBytecode::Object { object: bytes } => bytes,
        };

        Ok(Some(Artifact {
            contract_name,
            source_name: raw.source_name,
            abi: raw.abi,
            bytecode,
            build_info,
        }))
    }

    fn locate_build_info(artifact_path: &Path, stem: &str) -> Result<Option<PathBuf>> {
        let Some(parent) = artifact_path.parent() else {
            return Ok(None);
        };
        let dbg_path = parent.join(format!("{}.dbg.json", stem));
        if !dbg_path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&dbg_path)
            .context(format!("Failed to read {}", dbg_path.display()))?;
        let dbg: DebugFile = serde_json::from_str(&content)
            .context(format!("Failed to parse {}", dbg_path.display()))?;

        Ok(Some(parent.join(dbg.build_info)))
    }
}
