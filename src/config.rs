//! Configuration
//!
//! Every knob has a default; a `codevolve.toml` in the working directory (or an
//! explicit `--config` file) overrides them, and CLI flags override the file.

use crate::error::{ForgeError, Result};
use crate::scorer::Profile;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "codevolve.toml";

/// Out-of-process runner for JavaScript variants; TypeScript files have their types stripped first.
///
/// Loads `argv[1]`, resolves the binding named `argv[2]`, prints a handshake
/// line, then answers one `{"args":[...]}` line per call.
const NODE_SHIM: &str = r##"
const fs = require('fs'), vm = require('vm');
const [file, name] = process.argv.slice(1);
const out = (o) => process.stdout.write(JSON.stringify(o) + '\n');
const SPECIAL = { Infinity: Infinity, '-Infinity': -Infinity, NaN: NaN, undefined: undefined };
const dec = (v) => Array.isArray(v) ? v.map(dec)
  : (v && typeof v === 'object')
    ? ((Object.keys(v).length === 1 && typeof v.$special === 'string') ? SPECIAL[v.$special]
      : Object.fromEntries(Object.entries(v).map(([k, x]) => [k, dec(x)])))
    : v;
const enc = (v) => v === undefined ? { $special: 'undefined' }
  : (typeof v === 'number' && !isFinite(v)) ? { $special: isNaN(v) ? 'NaN' : (v > 0 ? 'Infinity' : '-Infinity') }
  : Array.isArray(v) ? v.map(enc)
  : (v && typeof v === 'object') ? Object.fromEntries(Object.entries(v).map(([k, x]) => [k, enc(x)]))
  : v;
let fn;
try {
  let src = fs.readFileSync(file, 'utf8');
  if (/\.[cm]?ts$/.test(file)) {
    const strip = require('module').stripTypeScriptTypes;
    if (typeof strip !== 'function') throw new Error('TypeScript variants need Node >= 22.13 or a runner.commands.ts entry');
    src = strip(src);
  }
  src = src.replace(/^(\s*)export\s+(default\s+)?/gm, '$1');
  const mod = { exports: {} };
  const body = '(function (module, exports, require) {\n' + src +
    '\n;return typeof ' + name + " !== 'undefined' ? " + name + ' : module.exports[' + JSON.stringify(name) + '];\n})';
  fn = vm.runInThisContext(body, { filename: file })(mod, mod.exports, require);
  if (typeof fn !== 'function') throw new Error(name + ' is not a function');
} catch (e) {
  out({ error: 'load: ' + (e && e.message || e) });
  process.exit(0);
}
out({ ready: true });
const rl = require('readline').createInterface({ input: process.stdin });
let chain = Promise.resolve();
rl.on('line', (line) => {
  chain = chain.then(async () => {
    try {
      const { args } = JSON.parse(line);
      out({ ok: enc(await fn(...dec(args))) });
    } catch (e) {
      out({ error: String(e && e.message || e) });
    }
  });
});
"##;

/// Out-of-process runner for Python variants; same protocol as [`NODE_SHIM`].
const PYTHON_SHIM: &str = r##"
import asyncio, importlib.util, inspect, json, math, sys
file, name = sys.argv[1], sys.argv[2]
def out(o):
    sys.stdout.write(json.dumps(o, allow_nan=False) + "\n")
    sys.stdout.flush()
SPECIAL = {"Infinity": math.inf, "-Infinity": -math.inf, "NaN": math.nan, "undefined": None}
def dec(v):
    if isinstance(v, list):
        return [dec(x) for x in v]
    if isinstance(v, dict):
        if len(v) == 1 and isinstance(v.get("$special"), str):
            return SPECIAL.get(v["$special"])
        return {k: dec(x) for k, x in v.items()}
    return v
def enc(v):
    if isinstance(v, float) and not math.isfinite(v):
        return {"$special": "NaN" if math.isnan(v) else ("Infinity" if v > 0 else "-Infinity")}
    if isinstance(v, (list, tuple)):
        return [enc(x) for x in v]
    if isinstance(v, dict):
        return {str(k): enc(x) for k, x in v.items()}
    return v
try:
    spec = importlib.util.spec_from_file_location("variant", file)
    mod = importlib.util.module_from_spec(spec)
    spec.loader.exec_module(mod)
    fn = getattr(mod, name)
    if not callable(fn):
        raise TypeError(name + " is not callable")
except BaseException as e:
    out({"error": "load: %s" % e})
    sys.exit(0)
out({"ready": True})
for line in sys.stdin:
    try:
        r = fn(*dec(json.loads(line)["args"]))
        if inspect.isawaitable(r):
            r = asyncio.run(r)
        out({"ok": enc(r)})
    except BaseException as e:
        out({"error": "%s: %s" % (type(e).__name__, e)})
"##;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeConfig {
    /// Artifact root
    pub workspace: PathBuf,
    /// Calls per test case; the average duration is recorded
    pub iterations: u32,
    /// Whole-corpus passes for regex throughput
    pub regex_iterations: u32,
    /// Wall-clock budget for one case's iteration loop (ms)
    pub case_timeout_ms: u64,
    pub default_profile: String,
    pub runner: RunnerConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generator: Option<GeneratorConfig>,
    pub mutation: MutationConfig,
    /// Profiles in addition to the built-ins; same-named entries override them
    pub profiles: Vec<Profile>,
    pub lineage: LineageConfig,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from(".codevolve"),
            iterations: 10,
            regex_iterations: 1000,
            case_timeout_ms: 5000,
            default_profile: "balanced".to_string(),
            runner: RunnerConfig::default(),
            generator: None,
            mutation: MutationConfig::default(),
            profiles: Vec::new(),
            lineage: LineageConfig::default(),
        }
    }
}

/// Commands that host a variant file behind the line-delimited JSON protocol.
///
/// Keyed by file extension. Each entry is an argv; `{file}` and `{name}` are
/// substituted in every element.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub commands: BTreeMap<String, Vec<String>>,
    /// Budget for the runner's handshake line (ms)
    pub startup_timeout_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        let node = vec![
            "node".to_string(),
            "-e".to_string(),
            NODE_SHIM.to_string(),
            "{file}".to_string(),
            "{name}".to_string(),
        ];
        let python = vec![
            "python3".to_string(),
            "-c".to_string(),
            PYTHON_SHIM.to_string(),
            "{file}".to_string(),
            "{name}".to_string(),
        ];

        let mut commands = BTreeMap::new();
        for ext in ["js", "cjs", "mjs", "ts", "cts", "mts"] {
            commands.insert(ext.to_string(), node.clone());
        }
        commands.insert("py".to_string(), python);

        Self {
            commands,
            startup_timeout_ms: 10_000,
        }
    }
}

impl RunnerConfig {
    /// Resolved argv for a variant file, or `None` when no runner handles its extension.
    pub fn command_for(&self, file: &Path, name: &str) -> Option<Vec<String>> {
        let ext = file.extension()?.to_str()?;
        let template = self.commands.get(ext)?;
        let file = file.to_string_lossy();
        Some(
            template
                .iter()
                .map(|arg| arg.replace("{file}", &file).replace("{name}", name))
                .collect(),
        )
    }
}

/// External variant generator used by `evolve`.
///
/// The command receives the generation request on stdin and must print the
/// candidate source on stdout. An optional `tags: a, b` line is recorded as
/// modification tags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub command: Vec<String>,
    /// Recorded as the lineage agent tag
    pub agent: String,
    pub timeout_secs: u64,
    pub generations: u32,
    pub variants_per_generation: u32,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            agent: "generator".to_string(),
            timeout_secs: 300,
            generations: 3,
            variants_per_generation: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MutationConfig {
    /// Fixed seed for reproducible sampling; random when unset
    pub seed: Option<u64>,
    /// Cap on new cases merged per `mutate` run
    pub max_cases: usize,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            seed: None,
            max_cases: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LineageConfig {
    /// Score at or above which a variant's tags count as "winning"
    pub high_score_threshold: f64,
    pub top_tags: usize,
}

impl Default for LineageConfig {
    fn default() -> Self {
        Self {
            high_score_threshold: 0.9,
            top_tags: 5,
        }
    }
}

impl ForgeConfig {
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: ForgeConfig =
            toml::from_str(content).map_err(|e| ForgeError::Config(e.to_string()))?;

        // User runners extend the built-in set rather than replacing it.
        for (ext, argv) in RunnerConfig::default().commands {
            config.runner.commands.entry(ext).or_insert(argv);
        }
        config.validate()?;
        Ok(config)
    }

    /// Load `path`, else `codevolve.toml` in the working directory if present, else defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let local = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !local.exists() {
                    return Ok(Self::default());
                }
                local
            }
        };
        log::info!("Loading config from: {}", path.display());
        let content = std::fs::read_to_string(&path).map_err(|e| ForgeError::io(&path, e))?;
        Self::from_toml(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.iterations == 0 {
            return Err(ForgeError::Config("iterations must be at least 1".into()));
        }
        if self.case_timeout_ms == 0 {
            return Err(ForgeError::Config("case_timeout_ms must be positive".into()));
        }
        for profile in &self.profiles {
            profile.validate()?;
        }
        Ok(())
    }

    pub fn case_timeout(&self) -> Duration {
        Duration::from_millis(self.case_timeout_ms)
    }
}
