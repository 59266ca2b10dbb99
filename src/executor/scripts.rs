//! Generates the `vvtest_util.py`/`vvtest_util.sh` utility scripts every test
//! execute directory gets, exposing the exact variable contract a test
//! script expects to source or import.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use crate::childenv::ChildEnv;
use crate::error::ExecError;
use crate::model::{ParamValue, TestId};

/// Accumulates lines with consistent indentation before a single flush to
/// disk.
#[derive(Default)]
struct LineWriter {
    lines: Vec<String>,
}

impl LineWriter {
    fn push(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    fn write(&self, path: &Path) -> Result<(), ExecError> {
        let mut f = std::fs::File::create(path).map_err(|source| ExecError::ScriptWrite {
            path: path.to_path_buf(),
            source,
        })?;
        for line in &self.lines {
            writeln!(f, "{line}").map_err(|source| ExecError::ScriptWrite {
                path: path.to_path_buf(),
                source,
            })?;
        }
        Ok(())
    }
}

/// Python-syntax repr of a dependency directory map, e.g.
/// `{"dep*": ["../dep.np=4"]}`.
fn py_dep_dir_map(map: &BTreeMap<String, Vec<std::path::PathBuf>>) -> String {
    let mut entries = Vec::new();
    for (pattern, dirs) in map {
        let dirs_repr: Vec<String> = dirs
            .iter()
            .map(|d| format!("\"{}\"", d.display()))
            .collect();
        entries.push(format!("\"{pattern}\": [{}]", dirs_repr.join(", ")));
    }
    format!("{{{}}}", entries.join(", "))
}

fn py_str(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// `TIMEOUT` renders as `-1`, never `None`, when the test has no configured
/// timeout — the value a test script checks against to mean "unbounded".
fn py_timeout(v: Option<u64>) -> String {
    match v {
        Some(n) => n.to_string(),
        None => "-1".to_string(),
    }
}

fn py_str_list(items: &[String]) -> String {
    let inner: Vec<String> = items.iter().map(|s| py_str(s)).collect();
    format!("[{}]", inner.join(", "))
}

fn py_path_list(items: &[std::path::PathBuf]) -> String {
    let inner: Vec<String> = items.iter().map(|p| py_str(&p.display().to_string())).collect();
    format!("[{}]", inner.join(", "))
}

fn py_int_list(items: &[u32]) -> String {
    let inner: Vec<String> = items.iter().map(|i| i.to_string()).collect();
    format!("[{}]", inner.join(", "))
}

/// A single parameter value rendered the way Python would assign it: bare
/// number for `Int`/`Float`, quoted string for `Str`.
fn py_param_value(v: &ParamValue) -> String {
    match v {
        ParamValue::Int(i) => i.to_string(),
        ParamValue::Float(f) => f.to_string(),
        ParamValue::Str(s) => py_str(s),
    }
}

fn py_param_dict(params: &BTreeMap<String, ParamValue>) -> String {
    let entries: Vec<String> = params
        .iter()
        .map(|(k, v)| format!("{}: {}", py_str(k), py_str(&v.as_display())))
        .collect();
    format!("{{{}}}", entries.join(", "))
}

/// Write both the Python and shell utility scripts into `xdir`.
pub fn write_util_scripts(xdir: &Path, test_id: &TestId, env: &ChildEnv) -> Result<(), ExecError> {
    write_python_util(xdir, test_id, env)?;
    write_shell_util(xdir, test_id, env)?;
    Ok(())
}

fn write_python_util(xdir: &Path, test_id: &TestId, env: &ChildEnv) -> Result<(), ExecError> {
    let mut w = LineWriter::default();
    w.push("# Auto-generated. Do not edit.");
    w.push(format!("NAME = {}", py_str(&test_id.name)));
    w.push(format!("TESTID = {}", py_str(&test_id.match_string())));
    w.push(format!("PLATFORM = {}", py_str(&env.platform.platform_name)));
    w.push(format!("COMPILER = {}", py_str(&env.platform.compiler)));
    w.push(format!("VVTESTSRC = {}", py_str(&env.platform.vvtestsrc.display().to_string())));
    w.push(format!("TESTROOT = {}", py_str(&env.results_root.display().to_string())));
    w.push(format!("PROJECT = {}", py_str(&env.platform.project)));
    w.push(format!("OPTIONS = {}", py_str_list(&env.platform.options)));
    w.push(format!("OPTIONS_OFF = {}", py_str_list(&env.platform.options_off)));
    w.push(format!("SRCDIR = {}", py_str(&env.test_source_dir.display().to_string())));
    w.push(format!("TIMEOUT = {}", py_timeout(env.timeout_secs)));
    w.push(format!("KEYWORDS = {}", py_str_list(&env.keywords)));
    w.push(format!("CONFIGDIR = {}", py_path_list(&env.platform.config_dirs)));

    w.push(format!("diff_exit_status = {}", env.exit_status.diff_exit_status));
    w.push(format!("skip_exit_status = {}", env.exit_status.skip_exit_status));
    w.push("import sys");
    w.push("opt_analyze = \"--execute-analysis-sections\" in sys.argv[1:]");

    w.push(format!("PARAM_DICT = {}", py_param_dict(&env.params)));
    for (name, value) in &env.params {
        w.push(format!("{name} = {}", py_param_value(value)));
    }
    if env.is_analyze {
        for (name, values) in &env.analyze_param_children {
            w.push(format!("PARAM_{name} = {}", py_str_list(values)));
        }
    }

    w.push(format!("DEPDIRS = {}", py_path_list(&env.dep_dirs)));
    w.push(format!("DEPDIRMAP = {}", py_dep_dir_map(&env.dep_dir_map)));

    w.push(format!("RESOURCE_np = {}", env.resources.total_cpus));
    w.push(format!("RESOURCE_IDS_np = {}", py_int_list(&env.resources.cpu_ids)));
    w.push(format!("RESOURCE_TOTAL_np = {}", env.resources.total_cpus));
    if env.resources.total_devices > 0 {
        w.push(format!("RESOURCE_ndevice = {}", env.resources.total_devices));
        w.push(format!("RESOURCE_IDS_ndevice = {}", py_int_list(&env.resources.device_ids)));
        w.push(format!("RESOURCE_TOTAL_ndevice = {}", env.resources.total_devices));
    } else {
        w.push("RESOURCE_ndevice = 0");
        w.push("RESOURCE_IDS_ndevice = []");
        w.push("RESOURCE_TOTAL_ndevice = 0");
    }

    for (k, v) in &env.extra_env {
        w.push(format!("{k} = {}", py_str(v)));
    }
    w.write(&xdir.join("vvtest_util.py"))
}

fn sh_str(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

fn sh_str_list(items: &[String]) -> String {
    items.iter().map(|s| sh_str(s)).collect::<Vec<_>>().join(" ")
}

fn sh_int_list(items: &[u32]) -> String {
    items.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(" ")
}

fn sh_path_list(items: &[std::path::PathBuf]) -> String {
    items
        .iter()
        .map(|p| sh_str(&p.display().to_string()))
        .collect::<Vec<_>>()
        .join(" ")
}

fn write_shell_util(xdir: &Path, test_id: &TestId, env: &ChildEnv) -> Result<(), ExecError> {
    let mut w = LineWriter::default();
    w.push("# Auto-generated. Do not edit.");
    w.push(format!("NAME=\"{}\"", test_id.name));
    w.push(format!("TESTID=\"{}\"", test_id.match_string()));
    w.push(format!("PLATFORM=\"{}\"", env.platform.platform_name));
    w.push(format!("COMPILER=\"{}\"", env.platform.compiler));
    w.push(format!("VVTESTSRC=\"{}\"", env.platform.vvtestsrc.display()));
    w.push(format!("TESTROOT=\"{}\"", env.results_root.display()));
    w.push(format!("PROJECT=\"{}\"", env.platform.project));
    w.push(format!("OPTIONS=\"{}\"", env.platform.options.join(" ")));
    w.push(format!("OPTIONS_OFF=\"{}\"", env.platform.options_off.join(" ")));
    w.push(format!("SRCDIR=\"{}\"", env.test_source_dir.display()));
    w.push(format!("TIMEOUT={}", py_timeout(env.timeout_secs)));
    w.push(format!("KEYWORDS=\"{}\"", env.keywords.join(" ")));
    let config_dirs: Vec<String> = env.platform.config_dirs.iter().map(|p| p.display().to_string()).collect();
    w.push(format!("CONFIGDIR=\"{}\"", config_dirs.join(":")));

    w.push(format!("diff_exit_status={}", env.exit_status.diff_exit_status));
    w.push(format!("skip_exit_status={}", env.exit_status.skip_exit_status));

    w.push("NUMCMDLINE=$#");
    w.push("CMDLINE_VARS=\"$*\"");
    w.push("cmdline_option () {");
    w.push("    for arg in $CMDLINE_VARS; do");
    w.push("        if [ \"X$arg\" = \"X$1\" ]; then return 0; fi");
    w.push("    done");
    w.push("    return 1");
    w.push("}");
    w.push("opt_analyze=0");
    w.push("cmdline_option --execute-analysis-sections && opt_analyze=1");

    for (name, value) in &env.params {
        w.push(format!("{name}=\"{}\"", value.as_display()));
    }
    if env.is_analyze {
        for (name, values) in &env.analyze_param_children {
            w.push(format!("PARAM_{name}=\"{}\"", values.join(" ")));
        }
    }

    w.push(format!("DEPDIRS=\"{}\"", sh_path_list(&env.dep_dirs)));
    for (pattern, dirs) in &env.dep_dir_map {
        let var_name = format!("DEPDIRMAP_{}", sanitize_shell_ident(pattern));
        w.push(format!("{var_name}=\"{}\"", sh_path_list(dirs)));
    }

    w.push(format!("RESOURCE_np={}", env.resources.total_cpus));
    w.push(format!("RESOURCE_IDS_np=\"{}\"", sh_int_list(&env.resources.cpu_ids)));
    w.push(format!("RESOURCE_TOTAL_np={}", env.resources.total_cpus));
    if env.resources.total_devices > 0 {
        w.push(format!("RESOURCE_ndevice={}", env.resources.total_devices));
        w.push(format!(
            "RESOURCE_IDS_ndevice=\"{}\"",
            sh_int_list(&env.resources.device_ids)
        ));
        w.push(format!("RESOURCE_TOTAL_ndevice={}", env.resources.total_devices));
    } else {
        w.push("RESOURCE_ndevice=0");
        w.push("RESOURCE_IDS_ndevice=\"\"");
        w.push("RESOURCE_TOTAL_ndevice=0");
    }

    for (k, v) in &env.extra_env {
        w.push(format!("{k}=\"{v}\""));
    }
    let _ = sh_str_list; // kept for callers that want a quoted-word-list form
    w.write(&xdir.join("vvtest_util.sh"))
}

/// Shell variable names can't hold glob metacharacters; replace anything
/// that isn't alphanumeric/underscore with `_` so each `DEPDIRMAP` pattern
/// gets a stable, sourceable variable name.
fn sanitize_shell_ident(pattern: &str) -> String {
    pattern
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dep_dir_map_renders_as_python_dict_literal() {
        let mut map = BTreeMap::new();
        map.insert(
            "dep*".to_string(),
            vec![std::path::PathBuf::from("../dep.np=4")],
        );
        let rendered = py_dep_dir_map(&map);
        assert_eq!(rendered, "{\"dep*\": [\"../dep.np=4\"]}");
    }

    #[test]
    fn timeout_renders_negative_one_for_missing_timeout() {
        assert_eq!(py_timeout(None), "-1");
        assert_eq!(py_timeout(Some(30)), "30");
    }

    #[test]
    fn param_dict_renders_values_as_strings_regardless_of_type() {
        let mut params = BTreeMap::new();
        params.insert("np".to_string(), ParamValue::Int(4));
        assert_eq!(py_param_dict(&params), "{\"np\": \"4\"}");
    }

    #[test]
    fn shell_ident_sanitizes_glob_metacharacters() {
        assert_eq!(sanitize_shell_ident("dep*"), "dep_");
        assert_eq!(sanitize_shell_ident("a/b*c"), "a_b_c");
    }
}
