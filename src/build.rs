//! Running a recipe's build steps in an isolated child process.
//!
//! The parent generates a `/bin/sh` script, starts it with a scrubbed
//! environment and blocks until it exits. The child's stdout is the result
//! pipe: the script moves it to fd 3, sends every step's output to
//! `<logs>/<name>/NN.<program>.log`, and on the first failing step writes one
//! JSON [`BuildFailure`] line to fd 3 before exiting with the step's status.

use crate::config::Paths;
use crate::error::{BrewError, Result};
use crate::options::BuildOptions;
use crate::recipe::Recipe;
use serde::{Deserialize, Serialize};
use std::fs;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info};

const SYSTEM_PATH: &str = "/usr/bin:/bin:/usr/sbin:/sbin";
const SIGINT: i32 = 2;

/// What the child reports when a step fails
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildFailure {
    /// 1-based step index
    pub step: usize,
    pub command: String,
    pub status: i32,
}

/// One build of one recipe
#[derive(Debug)]
pub struct BuildJob<'a> {
    pub recipe: &'a Recipe,
    pub options: &'a BuildOptions,
    /// Unpacked source to run in
    pub workdir: &'a Path,
    /// The keg being populated, exported as `$PREFIX`
    pub keg: &'a Path,
    pub paths: &'a Paths,
}

impl BuildJob<'_> {
    pub fn log_dir(&self) -> PathBuf {
        self.paths.formula_logs(&self.recipe.name)
    }

    /// `01.configure.log`, `02.make.log`, ...
    fn log_file(&self, step: usize, command: &str) -> PathBuf {
        self.log_dir()
            .join(format!("{:02}.{}.log", step, program_name(command)))
    }

    fn script(&self) -> String {
        let mut script = String::from("exec 3>&1 1>/dev/null\n");
        script.push_str(&format!("cd {} || exit 1\n", quote(&self.workdir.to_string_lossy())));

        for (i, command) in self.recipe.install.iter().enumerate() {
            let step = i + 1;
            let log = self.log_file(step, command);
            let command_json = serde_json::to_string(command).unwrap_or_else(|_| "\"\"".to_string());
            script.push_str(&format!(
                "( {cmd}\n) >{log} 2>&1 </dev/null || {{ s=$?; \
                 printf '{{\"step\":%s,\"command\":%s,\"status\":%s}}\\n' {step} {json} \"$s\" >&3; \
                 exit \"$s\"; }}\n",
                cmd = command,
                log = quote(&log.to_string_lossy()),
                step = step,
                json = quote(&command_json),
            ));
        }
        script
    }

    fn command(&self) -> Command {
        let mut command = Command::new("/bin/sh");
        command
            .arg("-c")
            .arg(self.script())
            .env_clear()
            .env(
                "PATH",
                format!("{}:{}", self.paths.prefix.join("bin").display(), SYSTEM_PATH),
            )
            .env("TMPDIR", &self.paths.temp)
            .env("LANG", "en_US.UTF-8")
            .env("PREFIX", self.keg)
            .env("BREWKIT_PREFIX", &self.paths.prefix)
            .env("BREWKIT_CELLAR", &self.paths.cellar)
            .env("BREWKIT_OPTIONS", self.options.used_options().join(" "))
            .current_dir(self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true);
        if let Some(home) = std::env::var_os("HOME") {
            command.env("HOME", home);
        }
        command
    }
}

/// Run the recipe's build steps into `job.keg`.
///
/// Old logs for the formula are removed first. A keg left empty by
/// otherwise successful steps is a failure too.
pub async fn run(job: &BuildJob<'_>) -> Result<()> {
    let name = &job.recipe.name;
    let logs = job.log_dir();
    if logs.exists() {
        fs::remove_dir_all(&logs)?;
    }
    fs::create_dir_all(&logs)?;
    fs::create_dir_all(job.keg)?;
    fs::create_dir_all(&job.paths.temp)?;

    // Shell errors outside the steps end up next to the step logs
    let stderr = fs::File::create(logs.join("00.sh.log"))?;
    let mut command = job.command();
    command.stderr(Stdio::from(stderr));

    info!("Building {} in {}", name, job.workdir.display());
    let mut child = command.spawn()?;
    let mut result_pipe = child.stdout.take().ok_or_else(|| {
        BrewError::Other(anyhow::anyhow!("build of {} has no result pipe", name))
    })?;

    let (report, status) = tokio::select! {
        outcome = async {
            let mut report = String::new();
            result_pipe.read_to_string(&mut report).await?;
            let status = child.wait().await?;
            Ok::<_, BrewError>((report, status))
        } => outcome?,
        _ = tokio::signal::ctrl_c() => return Err(BrewError::Interrupted),
    };

    debug!("{}: build exited with {}", name, status);
    let failure = report
        .lines()
        .rev()
        .find_map(|line| serde_json::from_str::<BuildFailure>(line).ok());

    if status.code() == Some(130) || status.signal() == Some(SIGINT) {
        return Err(BrewError::Interrupted);
    }

    if !status.success() {
        return Err(match failure {
            Some(f) => BrewError::BuildFailed {
                formula: name.clone(),
                command: f.command,
                status: f.status,
                logs,
            },
            None => BrewError::BuildFailed {
                formula: name.clone(),
                command: "suspicious installation failure".to_string(),
                status: status.code().unwrap_or(-1),
                logs,
            },
        });
    }

    let empty = fs::read_dir(job.keg)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(true);
    if empty {
        return Err(BrewError::BuildFailed {
            formula: name.clone(),
            command: "empty installation".to_string(),
            status: 0,
            logs,
        });
    }

    Ok(())
}

/// `./configure --prefix=...` → `configure`
fn program_name(command: &str) -> String {
    let first = command.split_whitespace().next().unwrap_or("step");
    let base = first.rsplit('/').next().unwrap_or(first);
    let clean: String = base
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect();
    if clean.is_empty() {
        "step".to_string()
    } else {
        clean
    }
}

/// Single-quote for `/bin/sh`
fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        paths: Paths,
        workdir: PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::with_prefix(tmp.path().join("prefix"));
        let workdir = tmp.path().join("src");
        fs::create_dir_all(&workdir).unwrap();
        Fixture {
            _tmp: tmp,
            paths,
            workdir,
        }
    }

    fn recipe(steps: &[&str]) -> Recipe {
        let mut recipe = Recipe::new("foo", "https://example.com/foo-1.0.tgz", "1.0");
        recipe.install = steps.iter().map(|s| s.to_string()).collect();
        recipe
    }

    #[test]
    fn test_program_name() {
        assert_eq!(program_name("./configure --prefix=$PREFIX"), "configure");
        assert_eq!(program_name("make install"), "make");
        assert_eq!(program_name("$CC -o x"), "CC");
        assert_eq!(program_name(""), "step");
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote("it's"), r"'it'\''s'");
    }

    #[tokio::test]
    async fn test_successful_build_populates_keg() {
        let fx = fixture();
        let recipe = recipe(&["mkdir -p \"$PREFIX/bin\"", "echo hi > \"$PREFIX/bin/foo\""]);
        let options = recipe.build_options(Vec::<String>::new());
        let keg = fx.paths.keg_path("foo", "1.0");
        let job = BuildJob {
            recipe: &recipe,
            options: &options,
            workdir: &fx.workdir,
            keg: &keg,
            paths: &fx.paths,
        };

        run(&job).await.unwrap();
        assert_eq!(fs::read_to_string(keg.join("bin/foo")).unwrap(), "hi\n");
        assert!(job.log_dir().join("01.mkdir.log").exists());
        assert!(job.log_dir().join("02.echo.log").exists());
    }

    #[tokio::test]
    async fn test_failing_step_is_reported() {
        let fx = fixture();
        let recipe = recipe(&["true", "echo boom; exit 3", "touch \"$PREFIX/never\""]);
        let options = recipe.build_options(Vec::<String>::new());
        let keg = fx.paths.keg_path("foo", "1.0");
        let job = BuildJob {
            recipe: &recipe,
            options: &options,
            workdir: &fx.workdir,
            keg: &keg,
            paths: &fx.paths,
        };

        match run(&job).await.unwrap_err() {
            BrewError::BuildFailed {
                command, status, logs, ..
            } => {
                assert_eq!(command, "echo boom; exit 3");
                assert_eq!(status, 3);
                assert_eq!(
                    fs::read_to_string(logs.join("02.echo.log")).unwrap(),
                    "boom\n"
                );
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!keg.join("never").exists());
    }

    #[tokio::test]
    async fn test_empty_installation() {
        let fx = fixture();
        let recipe = recipe(&["true"]);
        let options = recipe.build_options(Vec::<String>::new());
        let keg = fx.paths.keg_path("foo", "1.0");
        let job = BuildJob {
            recipe: &recipe,
            options: &options,
            workdir: &fx.workdir,
            keg: &keg,
            paths: &fx.paths,
        };

        assert!(matches!(
            run(&job).await,
            Err(BrewError::BuildFailed { command, .. }) if command == "empty installation"
        ));
    }

    #[tokio::test]
    async fn test_environment_is_scrubbed() {
        let fx = fixture();
        let recipe = recipe(&["env > \"$PREFIX/env.txt\""]);
        let options = recipe.build_options(["with-foo"]);
        let keg = fx.paths.keg_path("foo", "1.0");
        let job = BuildJob {
            recipe: &recipe,
            options: &options,
            workdir: &fx.workdir,
            keg: &keg,
            paths: &fx.paths,
        };

        run(&job).await.unwrap();
        let env = fs::read_to_string(keg.join("env.txt")).unwrap();
        assert!(env.contains(&format!("PREFIX={}", keg.display())));
        assert!(!env.contains("CARGO_PKG_NAME="));
    }
}
