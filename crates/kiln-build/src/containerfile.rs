//! Containerfile front-end.
//!
//! Accepts the subset of the Containerfile/Dockerfile syntax that maps onto
//! Kilnfile operations: `FROM [AS]`, `WORKDIR`, `COPY [--from] [--chown]`,
//! `RUN`, `USER`, `ENTRYPOINT` and `LABEL`. Shell-form `RUN` lines made only of
//! package-manager and account commands are lifted into `install` and
//! `create_user` steps; everything else stays an opaque `sh -c` command.

use kiln_common::{KilnError, KilnResult};

use crate::manifest::{
    CopySources, CreateUser, InstallPackages, Kilnfile, Operation, RunCommand, Stage,
};
use crate::packages::PackageManagerKind;

/// Instructions accepted and ignored.
const IGNORED: &[&str] = &["ARG", "CMD", "ENV", "EXPOSE", "HEALTHCHECK", "STOPSIGNAL", "VOLUME"];

/// Parse a Containerfile into a manifest.
///
/// # Errors
///
/// Returns [`KilnError::Config`] naming the line of the first instruction that
/// cannot be interpreted.
pub fn parse(content: &str) -> KilnResult<Kilnfile> {
    let mut manifest = Kilnfile::default();

    for (line_no, line) in logical_lines(content) {
        let (keyword, rest) = line
            .split_once(char::is_whitespace)
            .map_or((line.as_str(), ""), |(k, r)| (k, r.trim()));
        let keyword = keyword.to_ascii_uppercase();
        let fail = |message: String| KilnError::Config {
            message: format!("Containerfile line {line_no}: {message}"),
        };

        if keyword == "FROM" {
            manifest.stages.push(parse_from(rest).map_err(fail)?);
            continue;
        }
        if IGNORED.contains(&keyword.as_str()) {
            tracing::warn!(
                line = line_no,
                instruction = %keyword,
                "Ignoring unsupported instruction"
            );
            continue;
        }
        if keyword == "LABEL" {
            for word in split_words(rest) {
                let (key, value) = word
                    .split_once('=')
                    .ok_or_else(|| fail(format!("LABEL expects key=value, got '{word}'")))?;
                manifest.metadata.labels.insert(key.to_string(), value.to_string());
            }
            continue;
        }

        let stage = manifest
            .stages
            .last_mut()
            .ok_or_else(|| fail(format!("{keyword} before the first FROM")))?;

        match keyword.as_str() {
            "WORKDIR" => stage.steps.push(Operation::SetWorkdir(rest.to_string())),
            "USER" => stage.steps.push(Operation::SetUser(rest.to_string())),
            "COPY" | "ADD" => stage.steps.push(parse_copy(rest).map_err(fail)?),
            "RUN" => parse_run(stage, rest).map_err(fail)?,
            "ENTRYPOINT" => stage.entrypoint = Some(exec_form(rest).map_err(fail)?),
            other => return Err(fail(format!("unsupported instruction {other}"))),
        }
    }

    Ok(manifest)
}

/// Join `\` continuations and drop comments and blank lines.
fn logical_lines(content: &str) -> Vec<(usize, String)> {
    let mut lines = Vec::new();
    let mut current: Option<(usize, String)> = None;

    for (idx, raw) in content.lines().enumerate() {
        let trimmed = raw.trim();
        if trimmed.starts_with('#') || (trimmed.is_empty() && current.is_none()) {
            continue;
        }

        let (text, continues) = match trimmed.strip_suffix('\\') {
            Some(text) => (text.trim_end(), true),
            None => (trimmed, false),
        };

        let (_, line) = current.get_or_insert_with(|| (idx + 1, String::new()));
        if !line.is_empty() && !text.is_empty() {
            line.push(' ');
        }
        line.push_str(text);

        if !continues {
            lines.extend(current.take());
        }
    }
    lines.extend(current);
    lines
}

fn parse_from(rest: &str) -> Result<Stage, String> {
    let words: Vec<&str> = rest.split_whitespace().collect();
    match words.as_slice() {
        [image] => Ok(Stage::new(*image)),
        [image, as_kw, name] if as_kw.eq_ignore_ascii_case("as") => {
            Ok(Stage::new(*image).named(*name))
        }
        _ => Err(format!("cannot parse FROM '{rest}'")),
    }
}

fn parse_copy(rest: &str) -> Result<Operation, String> {
    let mut from = None;
    let mut chown = None;
    let mut paths = Vec::new();

    let words = if rest.starts_with('[') {
        exec_form(rest)?
    } else {
        split_words(rest)
    };
    for word in words {
        if let Some(stage) = word.strip_prefix("--from=") {
            from = Some(stage.to_string());
        } else if let Some(owner) = word.strip_prefix("--chown=") {
            chown = Some(owner.to_string());
        } else if word.starts_with("--") {
            return Err(format!("unsupported COPY flag {word}"));
        } else {
            paths.push(word);
        }
    }

    let Some(to) = paths.pop() else {
        return Err("COPY needs a source and a destination".to_string());
    };
    if paths.is_empty() {
        return Err("COPY needs a source and a destination".to_string());
    }

    Ok(Operation::CopySources(CopySources {
        src: paths,
        to,
        from,
        chown,
    }))
}

fn exec_form(rest: &str) -> Result<Vec<String>, String> {
    if rest.starts_with('[') {
        serde_json::from_str(rest).map_err(|e| format!("invalid JSON argv: {e}"))
    } else {
        Ok(vec!["sh".to_string(), "-c".to_string(), rest.to_string()])
    }
}

/// A shell command recognized inside a `RUN` line.
#[derive(Debug, PartialEq, Eq)]
enum ShellStep {
    Refresh,
    Install(PackageManagerKind, Vec<String>, bool),
    Purge,
    AddUser(CreateUser),
    AddGroup(String),
}

fn parse_run(stage: &mut Stage, rest: &str) -> Result<(), String> {
    if rest.starts_with('[') {
        stage
            .steps
            .push(Operation::RunCommand(RunCommand::Simple(exec_form(rest)?)));
        return Ok(());
    }

    let lifted = rest
        .split("&&")
        .map(|segment| classify(&split_words(segment)))
        .collect::<Option<Vec<_>>>()
        .filter(|steps| {
            steps
                .iter()
                .any(|s| matches!(s, ShellStep::Install(..) | ShellStep::AddUser(_)))
        });
    let Some(steps) = lifted else {
        stage.steps.push(Operation::run(["sh", "-c", rest]));
        return Ok(());
    };

    let purged = steps.contains(&ShellStep::Purge);
    for step in steps {
        match step {
            ShellStep::Install(kind, packages, no_cache) => {
                stage.packages = kind;
                stage.steps.push(Operation::InstallPackages(InstallPackages {
                    packages,
                    clean: purged || no_cache,
                }));
            }
            ShellStep::AddUser(user) => stage.steps.push(Operation::CreateUser(user)),
            ShellStep::AddGroup(group) => {
                tracing::debug!(%group, "Dropping group creation; accounts carry no groups");
            }
            ShellStep::Refresh | ShellStep::Purge => {}
        }
    }
    Ok(())
}

fn classify(words: &[String]) -> Option<ShellStep> {
    let words: Vec<&str> = words.iter().map(String::as_str).collect();
    let (program, args) = words.split_first()?;

    match (*program, args.first().copied()) {
        ("apt-get" | "apt" | "apk", Some("update")) | ("dnf", Some("makecache")) => {
            Some(ShellStep::Refresh)
        }
        ("apt-get" | "apt" | "dnf" | "yum", Some("clean")) => Some(ShellStep::Purge),
        ("rm", _) if args.iter().any(|a| is_index_cache(a)) => Some(ShellStep::Purge),
        ("apt-get" | "apt", _) if args.contains(&"install") => Some(ShellStep::Install(
            PackageManagerKind::Apt,
            after(args, "install"),
            false,
        )),
        ("apk", _) if args.contains(&"add") => Some(ShellStep::Install(
            PackageManagerKind::Apk,
            after(args, "add"),
            args.contains(&"--no-cache"),
        )),
        ("dnf" | "yum", _) if args.contains(&"install") => Some(ShellStep::Install(
            PackageManagerKind::Dnf,
            after(args, "install"),
            false,
        )),
        ("useradd" | "adduser", _) => parse_useradd(program, args).map(ShellStep::AddUser),
        ("groupadd" | "addgroup", _) => args
            .iter()
            .rev()
            .find(|a| !a.starts_with('-'))
            .map(|group| ShellStep::AddGroup((*group).to_string())),
        _ => None,
    }
}

fn after(args: &[&str], subcommand: &str) -> Vec<String> {
    args.iter()
        .skip_while(|a| **a != subcommand)
        .skip(1)
        .filter(|a| !a.starts_with('-'))
        .map(|a| (*a).to_string())
        .collect()
}

fn is_index_cache(path: &str) -> bool {
    [
        PackageManagerKind::Apt,
        PackageManagerKind::Apk,
        PackageManagerKind::Dnf,
    ]
    .iter()
    .any(|kind| path.trim_end_matches('*').trim_end_matches('/') == kind.index_cache_dir())
}

fn parse_useradd(program: &str, args: &[&str]) -> Option<CreateUser> {
    let mut user = CreateUser {
        name: String::new(),
        shell: "/usr/sbin/nologin".to_string(),
        home: program == "adduser",
    };

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match *arg {
            "-s" | "--shell" => user.shell = (*iter.next()?).to_string(),
            "-m" | "--create-home" => user.home = true,
            "-M" | "-H" | "--no-create-home" => user.home = false,
            "-u" | "--uid" | "-g" | "--gid" | "-G" | "--groups" | "-c" | "--comment" | "-d"
            | "--home-dir" | "-h" | "--home" => {
                iter.next()?;
            }
            flag if flag.starts_with('-') => {}
            name => user.name = name.to_string(),
        }
    }

    (!user.name.is_empty()).then_some(user)
}

/// Split a shell fragment into words, honouring single and double quotes.
fn split_words(input: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;

    for c in input.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}
