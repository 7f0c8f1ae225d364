//! Cross-validation against torch running in an external python interpreter.
//!
//! A run sends `{seed, code, inputs, outputs}` as JSON on the interpreter's
//! stdin. The driver seeds torch, binds every input by name as a `float64`
//! tensor, executes the snippet, and writes the requested names back as
//! tensors together with the time the snippet took. List and tuple outputs
//! come back flattened as `name.1`, `name.2`, ...

use std::{
    collections::{hash_map::DefaultHasher, BTreeMap, HashMap},
    env, fs,
    hash::{Hash, Hasher},
    io::Write,
    path::Path,
    process::{Command, Stdio},
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{tensor::Tensor, util};

lazy_static! {
    static ref CONFIG: BridgeConfig = BridgeConfig::from_env();
}

const DRIVER: &str = r#"
import json, math, sys, time
import torch

request = json.load(sys.stdin)
torch.manual_seed(request["seed"])
torch.set_default_dtype(torch.float64)

scope = {"torch": torch, "nn": torch.nn}
for name, t in request["inputs"].items():
    data = [float(x) for x in t["data"]]
    scope[name] = torch.tensor(data, dtype=torch.float64).reshape(t["shape"])

start = time.perf_counter()
exec(request["code"], scope)
elapsed = time.perf_counter() - start

def number(x):
    if math.isnan(x):
        return "NaN"
    if math.isinf(x):
        return "Infinity" if x > 0 else "-Infinity"
    return x

def encode(value):
    value = torch.as_tensor(value).detach().to(torch.float64)
    data = [number(x) for x in value.reshape(-1).tolist()]
    return {"data": data, "shape": list(value.shape) or [1]}

tensors, defined = {}, []
for name in request["outputs"]:
    if name not in scope:
        continue
    defined.append(name)
    value = scope[name]
    if isinstance(value, (list, tuple)):
        for i, item in enumerate(value, 1):
            tensors[f"{name}.{i}"] = encode(item)
    else:
        tensors[name] = encode(value)

json.dump({"tensors": tensors, "defined": defined, "elapsed": elapsed}, sys.stdout, allow_nan=False)
"#;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Interpreter with torch installed, `TORCH_PYTHON` or `python3`.
    pub interpreter: String,
    /// Reuse earlier results from the cache dir, off when `NO_CACHE` is set.
    pub use_cache: bool,
}

impl BridgeConfig {
    pub fn from_env() -> BridgeConfig {
        BridgeConfig {
            interpreter: env::var("TORCH_PYTHON").unwrap_or_else(|_| "python3".to_string()),
            use_cache: env::var("NO_CACHE").is_err(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReferenceRun {
    pub tensors: HashMap<String, Tensor>,
    pub elapsed: Duration,
}

impl ReferenceRun {
    pub fn tensor(&self, name: &str) -> Result<&Tensor> {
        self.tensors
            .get(name)
            .ok_or(anyhow!("reference run has no output named {name}"))
    }
}

#[derive(Serialize)]
struct Request<'a> {
    seed: u64,
    code: &'a str,
    inputs: BTreeMap<&'a str, &'a Tensor>,
    outputs: &'a [&'a str],
}

#[derive(Debug, Serialize, Deserialize)]
struct Response {
    tensors: HashMap<String, Tensor>,
    /// Requested names the snippet bound, including empty lists.
    defined: Vec<String>,
    elapsed: f64,
}

#[derive(Debug, Clone)]
pub struct TorchBridge {
    config: BridgeConfig,
    torch_version: String,
}

impl TorchBridge {
    /// Bridge configured from the environment, `None` when the interpreter
    /// cannot be started or cannot import torch.
    pub fn locate() -> Option<TorchBridge> {
        TorchBridge::with_config(CONFIG.clone())
    }

    pub fn with_config(config: BridgeConfig) -> Option<TorchBridge> {
        let probe = Command::new(&config.interpreter)
            .args(["-c", "import torch; print(torch.__version__)"])
            .output();

        match probe {
            Ok(output) if output.status.success() => {
                let torch_version = String::from_utf8_lossy(&output.stdout).trim().to_string();
                info!(
                    "using torch {} through {}",
                    torch_version, config.interpreter
                );
                Some(TorchBridge {
                    config,
                    torch_version,
                })
            }
            Ok(output) => {
                warn!(
                    "{} cannot import torch: {}",
                    config.interpreter,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                None
            }
            Err(err) => {
                warn!("unable to start {}: {}", config.interpreter, err);
                None
            }
        }
    }

    pub fn torch_version(&self) -> &str {
        &self.torch_version
    }

    /// Executes `code` with `inputs` bound by name after seeding torch with
    /// `seed`, and collects the variables named in `outputs`.
    pub fn run(
        &self,
        code: &str,
        inputs: &HashMap<String, Tensor>,
        outputs: &[&str],
        seed: u64,
    ) -> Result<ReferenceRun> {
        let request = encode_request(code, inputs, outputs, seed)?;

        let cache_path = if self.config.use_cache {
            let key = cache_key(&request, &self.config.interpreter, &self.torch_version);
            Some(util::cache_dir()?.join("reference").join(key))
        } else {
            None
        };

        let response: Response = match &cache_path {
            Some(path) if path.exists() => {
                debug!("using cached reference run in {:?}", path);
                let cached = fs::read_to_string(path)?;
                serde_json::from_str(&cached)
                    .with_context(|| format!("corrupt cached reference run {path:?}"))?
            }
            _ => {
                let response = self.execute(&request)?;
                if let Some(path) = &cache_path {
                    store(path, &response)?;
                }
                response
            }
        };

        decode_response(response, outputs)
    }

    fn execute(&self, request: &str) -> Result<Response> {
        debug!("running reference snippet through {}", self.config.interpreter);

        let mut child = Command::new(&self.config.interpreter)
            .args(["-c", DRIVER])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to start {}", self.config.interpreter))?;

        // stdin is closed when the closure returns, before the child is awaited
        let sent = child
            .stdin
            .take()
            .map(|mut stdin| stdin.write_all(request.as_bytes()));

        let output = child.wait_with_output()?;
        if !output.status.success() {
            bail!(
                "reference interpreter exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        sent.ok_or(anyhow!("reference interpreter has no stdin"))?
            .context("failed to send the request to the reference interpreter")?;

        serde_json::from_slice(&output.stdout).context("malformed reference interpreter output")
    }
}

fn encode_request(
    code: &str,
    inputs: &HashMap<String, Tensor>,
    outputs: &[&str],
    seed: u64,
) -> Result<String> {
    let request = Request {
        seed,
        code,
        inputs: inputs.iter().map(|(k, v)| (k.as_str(), v)).collect(),
        outputs,
    };
    Ok(serde_json::to_string(&request)?)
}

fn cache_key(request: &str, interpreter: &str, torch_version: &str) -> String {
    let mut hasher = DefaultHasher::new();
    request.hash(&mut hasher);
    interpreter.hash(&mut hasher);
    torch_version.hash(&mut hasher);
    format!("{:016x}.json", hasher.finish())
}

fn store(path: &Path, response: &Response) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::write(path, serde_json::to_string(response)?)?;
    debug!("cached reference run in {:?}", path);
    Ok(())
}

fn decode_response(response: Response, outputs: &[&str]) -> Result<ReferenceRun> {
    for name in outputs {
        if !response.defined.iter().any(|defined| defined == name) {
            bail!("reference snippet did not define {name}");
        }
    }

    Ok(ReferenceRun {
        tensors: response.tensors,
        elapsed: Duration::from_secs_f64(response.elapsed.max(0.0)),
    })
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, time::Duration};

    use crate::{
        reference::{cache_key, decode_response, encode_request, BridgeConfig, TorchBridge},
        tensor::Tensor,
    };

    #[test]
    fn request_is_independent_of_insertion_order() {
        let a = Tensor::from_vec(vec![1.0, 2.0]);
        let b = Tensor::from_scalar(0.1);

        let mut first = HashMap::new();
        first.insert("a".to_string(), a.clone());
        first.insert("b".to_string(), b.clone());
        let mut second = HashMap::new();
        second.insert("b".to_string(), b);
        second.insert("a".to_string(), a);

        let first = encode_request("y = a * b", &first, &["y"], 1).unwrap();
        let second = encode_request("y = a * b", &second, &["y"], 1).unwrap();

        assert_eq!(first, second);
        assert_eq!(
            cache_key(&first, "python3", "2.1.0"),
            cache_key(&second, "python3", "2.1.0")
        );
        assert!(first.contains(r#""inputs":{"a":{"data":[1.0,2.0],"shape":[2]},"b""#));
    }

    #[test]
    fn seed_changes_cache_key() {
        let inputs = HashMap::new();
        let first = encode_request("y = torch.rand(3)", &inputs, &["y"], 1).unwrap();
        let second = encode_request("y = torch.rand(3)", &inputs, &["y"], 2).unwrap();

        assert_ne!(
            cache_key(&first, "python3", "2.1.0"),
            cache_key(&second, "python3", "2.1.0")
        );
    }

    #[test]
    fn interpreter_and_torch_version_change_cache_key() {
        let request = encode_request("y = torch.rand(3)", &HashMap::new(), &["y"], 1).unwrap();
        let key = cache_key(&request, "python3", "2.1.0");

        assert_ne!(key, cache_key(&request, "python3", "2.2.0"));
        assert_ne!(key, cache_key(&request, "/opt/torch/bin/python", "2.1.0"));
    }

    #[test]
    fn decodes_interpreter_output() {
        let response = serde_json::from_str(
            r#"{"tensors": {"y": {"data": [0.30000000000000004, -1e-17], "shape": [2]},
                "grads.1": {"data": [1.0], "shape": [1]},
                "nan": {"data": ["NaN", "-Infinity"], "shape": [2]}},
                "defined": ["y", "grads", "nan", "empty"], "elapsed": 0.25}"#,
        )
        .unwrap();

        let run = decode_response(response, &["y", "grads", "nan", "empty"]).unwrap();

        assert_eq!(run.tensor("y").unwrap().data, vec![0.1 + 0.2, -1e-17]);
        assert_eq!(run.tensor("grads.1").unwrap().shape, vec![1]);
        assert_eq!(run.elapsed, Duration::from_millis(250));
        assert!(run.tensor("grads").is_err());
        assert!(run.tensor("nan").unwrap().data[0].is_nan());
        assert_eq!(run.tensor("nan").unwrap().data[1], f64::NEG_INFINITY);
        assert!(run.tensor("empty.1").is_err());
    }

    #[test]
    fn missing_output_is_an_error() {
        let response =
            serde_json::from_str(r#"{"tensors": {}, "defined": [], "elapsed": 0.0}"#).unwrap();

        let err = decode_response(response, &["y"]).unwrap_err();

        assert!(err.to_string().contains("did not define y"));
    }

    #[test]
    fn locate_fails_without_interpreter() {
        let config = BridgeConfig {
            interpreter: "normgrad-no-such-interpreter".to_string(),
            use_cache: false,
        };

        assert!(TorchBridge::with_config(config).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn early_exit_reports_status_not_broken_pipe() {
        let bridge = TorchBridge {
            config: BridgeConfig {
                interpreter: "false".to_string(),
                use_cache: false,
            },
            torch_version: "none".to_string(),
        };
        let mut inputs = HashMap::new();
        inputs.insert("x".to_string(), Tensor::zeros(1 << 20));
        let request = encode_request("y = x", &inputs, &["y"], 0).unwrap();

        let err = bridge.execute(&request).unwrap_err();

        assert!(err.to_string().contains("exited with"), "{err:#}");
    }
}
