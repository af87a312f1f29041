//! Command-line front end: scan a directory, rewrite the matching
//! assemblies under new names, and redirect the references of the files
//! that consume them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use walkdir::WalkDir;

use shade_image::{Editor, RefIdentity, StrongNameKey};

fn app() -> Command {
    Command::new("shade")
        .about("Rewrites managed assembly identities so copies can coexist")
        .arg(
            Arg::new("target-dir")
                .long("target-dir")
                .value_parser(value_parser!(PathBuf))
                .required(true)
                .help("Directory scanned for assemblies to rewrite"),
        )
        .arg(
            Arg::new("names")
                .required(true)
                .num_args(1..)
                .help("Simple assembly names to rewrite; * wildcards allowed"),
        )
        .arg(
            Arg::new("key")
                .long("key")
                .value_parser(value_parser!(PathBuf))
                .help("Strong-name key file used to re-sign rewritten assemblies"),
        )
        .arg(
            Arg::new("exclude")
                .long("exclude")
                .action(ArgAction::Append)
                .help("Simple names to skip even when a name pattern matches"),
        )
        .arg(
            Arg::new("prefix")
                .long("prefix")
                .help("Prefix prepended to each rewritten assembly name"),
        )
        .arg(
            Arg::new("suffix")
                .long("suffix")
                .help("Suffix appended to each rewritten assembly name"),
        )
        .arg(
            Arg::new("internalize")
                .long("internalize")
                .action(ArgAction::SetTrue)
                .help("Reduce public types of rewritten assemblies to internal"),
        )
        .arg(
            Arg::new("reference")
                .long("reference")
                .action(ArgAction::Append)
                .value_parser(value_parser!(PathBuf))
                .help("Assemblies whose references to rewritten names are redirected"),
        )
}

/// Case-insensitive match with `*` wildcards, as used for simple assembly
/// names.
fn wildcard_match(pattern: &str, name: &str) -> bool {
    fn inner(pattern: &[u8], name: &[u8]) -> bool {
        match (pattern.first(), name.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&pattern[1..], name) || (!name.is_empty() && inner(pattern, &name[1..]))
            }
            (Some(p), Some(n)) => {
                p.eq_ignore_ascii_case(n) && inner(&pattern[1..], &name[1..])
            }
            _ => false,
        }
    }
    inner(pattern.as_bytes(), name.as_bytes())
}

struct Rewrite {
    path: PathBuf,
    old_name: String,
    new_name: String,
}

fn collect_targets(
    dir: &Path,
    patterns: &[String],
    excludes: &[String],
    references: &[PathBuf],
) -> Result<Vec<PathBuf>> {
    let mut targets = Vec::new();
    for entry in WalkDir::new(dir).max_depth(1) {
        let entry = entry.with_context(|| format!("scanning {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path
            .extension()
            .map_or(true, |ext| !ext.eq_ignore_ascii_case("dll"))
        {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if references.iter().any(|r| r.as_path() == path) {
            continue;
        }
        if excludes.iter().any(|e| wildcard_match(e, stem)) {
            continue;
        }
        if patterns.iter().any(|p| wildcard_match(p, stem)) {
            targets.push(path.to_path_buf());
        }
    }
    targets.sort();
    Ok(targets)
}

fn execute(matches: &ArgMatches) -> Result<()> {
    let target_dir = matches.get_one::<PathBuf>("target-dir").unwrap();
    let patterns: Vec<String> = matches
        .get_many::<String>("names")
        .unwrap()
        .cloned()
        .collect();
    let excludes: Vec<String> = matches
        .get_many::<String>("exclude")
        .unwrap_or_default()
        .cloned()
        .collect();
    let references: Vec<PathBuf> = matches
        .get_many::<PathBuf>("reference")
        .unwrap_or_default()
        .cloned()
        .collect();
    let prefix = matches.get_one::<String>("prefix").cloned().unwrap_or_default();
    let suffix = matches.get_one::<String>("suffix").cloned().unwrap_or_default();
    let internalize = matches.get_flag("internalize");

    if prefix.is_empty() && suffix.is_empty() {
        bail!("at least one of --prefix and --suffix must be provided");
    }

    let key = matches
        .get_one::<PathBuf>("key")
        .map(|path| {
            StrongNameKey::from_file(path)
                .with_context(|| format!("reading key file {}", path.display()))
        })
        .transpose()?;

    let targets = collect_targets(target_dir, &patterns, &excludes, &references)?;
    if targets.is_empty() {
        bail!("no assemblies under {} match the given names", target_dir.display());
    }

    // The reference assemblies' simple names become friends of every
    // internalized target.
    let mut friend_names = Vec::new();
    for path in &references {
        let editor = Editor::open(path)
            .with_context(|| format!("opening reference {}", path.display()))?;
        friend_names.push(editor.assembly_name()?);
    }

    let mut rewrites: BTreeMap<String, Rewrite> = BTreeMap::new();
    for path in &targets {
        let mut editor =
            Editor::open(path).with_context(|| format!("opening {}", path.display()))?;
        let old_name = editor.assembly_name()?;
        let new_name = format!("{prefix}{old_name}{suffix}");
        tracing::info!(%old_name, %new_name, path = %path.display(), "rewriting assembly");

        editor.rename(&new_name)?;
        match &key {
            Some(key) => editor.set_public_key(key.public_key_blob())?,
            None => editor.clear_public_key()?,
        }
        if internalize {
            editor.internalize_types()?;
            for friend in &friend_names {
                editor.add_friend(friend, key.as_ref().map(|k| k.public_key_blob()))?;
            }
        }
        editor
            .save(path, key.as_ref())
            .with_context(|| format!("saving {}", path.display()))?;

        rewrites.insert(
            old_name.clone(),
            Rewrite {
                path: path.clone(),
                old_name,
                new_name,
            },
        );
    }

    let token = key.as_ref().map(|k| k.token());
    for path in &references {
        let mut editor =
            Editor::open(path).with_context(|| format!("opening reference {}", path.display()))?;
        let mut redirected = 0;
        for rewrite in rewrites.values() {
            let identity = match &token {
                Some(token) => RefIdentity::Token(token),
                None => RefIdentity::None,
            };
            if editor.redirect_assembly_ref(&rewrite.old_name, &rewrite.new_name, identity)? {
                redirected += 1;
                tracing::debug!(
                    reference = %path.display(),
                    from = %rewrite.old_name,
                    to = %rewrite.new_name,
                    "redirected assembly reference"
                );
            }
        }
        if redirected > 0 {
            // Only re-sign references that carry a signature slot; unsigned
            // consumers stay unsigned.
            let reference_key = key
                .as_ref()
                .filter(|_| editor.pe().cli.strong_name_signature.virtual_address != 0);
            editor
                .save(path, reference_key)
                .with_context(|| format!("saving reference {}", path.display()))?;
            println!(
                "{}: redirected {} reference(s)",
                path.display(),
                redirected
            );
        }
    }

    for rewrite in rewrites.values() {
        println!(
            "{}: {} -> {}",
            rewrite.path.display(),
            rewrite.old_name,
            rewrite.new_name
        );
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let matches = app().get_matches();
    if let Err(error) = execute(&matches) {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}
