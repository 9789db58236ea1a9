//! Terminal rendering of query results in a ripgrep-like layout

use crate::error::ErrorPayload;
use crate::query::{ErrorMap, FindResult, IndexResult, SearchResult};
use crate::repo::Repo;
use crate::router::NodeStatus;
use regex::Regex;
use std::io::{self, Write};
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

pub fn color_choice(color: bool) -> ColorChoice {
    if color { ColorChoice::Auto } else { ColorChoice::Never }
}

pub fn stdout(color: bool) -> StandardStream {
    StandardStream::stdout(color_choice(color))
}

pub fn stderr(color: bool) -> StandardStream {
    StandardStream::stderr(color_choice(color))
}

/// Print search matches grouped by file and repo.
///
/// Results carry match and context lines together; lines `highlight`
/// matches are printed as matches (`:`), the rest as context (`-`).
pub fn write_search<W: WriteColor>(
    out: &mut W,
    result: &SearchResult,
    highlight: Option<&Regex>,
) -> io::Result<()> {
    let mut first = true;
    for (file, repos) in &result.matches {
        for (repo, lines) in repos {
            if !first {
                writeln!(out)?;
            }
            first = false;

            out.set_color(ColorSpec::new().set_fg(Some(Color::Magenta)).set_bold(true))?;
            write!(out, "{}", file)?;
            out.reset()?;
            writeln!(out, " [{}]", repo)?;

            let mut last: Option<u64> = None;
            for (&n, line) in lines {
                if let Some(last) = last
                    && n > last + 1
                {
                    out.set_color(ColorSpec::new().set_fg(Some(Color::Cyan)))?;
                    writeln!(out, "--")?;
                    out.reset()?;
                }
                last = Some(n);
                write_line(out, n, line, highlight)?;
            }
        }
    }
    Ok(())
}

fn write_line<W: WriteColor>(
    out: &mut W,
    n: u64,
    line: &str,
    highlight: Option<&Regex>,
) -> io::Result<()> {
    let spans: Vec<(usize, usize)> = match highlight {
        Some(re) => re.find_iter(line).map(|m| (m.start(), m.end())).collect(),
        None => vec![(0, 0)],
    };
    let is_match = !spans.is_empty();

    out.set_color(ColorSpec::new().set_fg(Some(Color::Green)))?;
    write!(out, "{}", n)?;
    out.reset()?;
    write!(out, "{}", if is_match { ':' } else { '-' })?;

    let mut at = 0;
    for (start, end) in spans.into_iter().filter(|(s, e)| e > s) {
        write!(out, "{}", &line[at..start])?;
        out.set_color(ColorSpec::new().set_fg(Some(Color::Red)).set_bold(true))?;
        write!(out, "{}", &line[start..end])?;
        out.reset()?;
        at = end;
    }
    writeln!(out, "{}", &line[at..])
}

/// One line per file, followed by the repos it was found in
pub fn write_find<W: WriteColor>(out: &mut W, result: &FindResult) -> io::Result<()> {
    for (file, repos) in &result.matches {
        out.set_color(ColorSpec::new().set_fg(Some(Color::Magenta)))?;
        write!(out, "{}", file)?;
        out.reset()?;
        let keys: Vec<&str> = repos.keys().map(String::as_str).collect();
        writeln!(out, " [{}]", keys.join(", "))?;
    }
    Ok(())
}

pub fn write_index<W: WriteColor>(out: &mut W, result: &IndexResult) -> io::Result<()> {
    if let Some(repo) = &result.repo {
        writeln!(
            out,
            "{} {}: {} files, {} dirs, {} shards, {} bytes indexed in {:.2?}",
            repo.key,
            repo.state,
            repo.num_files,
            repo.num_dirs,
            repo.num_shards,
            repo.size_data,
            repo.elapsed_indexing
        )?;
    }
    Ok(())
}

pub fn write_repos<W: WriteColor>(out: &mut W, repos: &[Repo]) -> io::Result<()> {
    for repo in repos {
        out.set_color(ColorSpec::new().set_bold(true))?;
        write!(out, "{}", repo.key)?;
        out.reset()?;
        let host = match repo.host() {
            "" => "local",
            host => host,
        };
        writeln!(
            out,
            "\t{}\t{} files\t{}\t{}",
            repo.state,
            repo.num_files,
            host,
            repo.root.display()
        )?;
    }
    Ok(())
}

pub fn write_status<W: Write>(out: &mut W, status: &NodeStatus) -> io::Result<()> {
    writeln!(out, "meshgrep node status:")?;
    writeln!(out, "  Host: {}", if status.host.is_empty() { "-" } else { &status.host })?;
    writeln!(out, "  Uptime: {}s", status.uptime.as_secs())?;
    writeln!(out, "  Repos: {}", status.num_repos)?;
    writeln!(out, "  Queries served: {}", status.queries_served)
}

/// Per-repo/per-host errors, then the global error if any
pub fn write_errors<W: WriteColor>(
    out: &mut W,
    errors: &ErrorMap,
    error: Option<&ErrorPayload>,
) -> io::Result<()> {
    for (key, err) in errors {
        out.set_color(ColorSpec::new().set_fg(Some(Color::Yellow)))?;
        write!(out, "{}", key)?;
        out.reset()?;
        writeln!(out, ": {}", err)?;
    }
    if let Some(err) = error {
        out.set_color(ColorSpec::new().set_fg(Some(Color::Red)).set_bold(true))?;
        write!(out, "error[{}]", err.kind.http_status())?;
        out.reset()?;
        writeln!(out, ": {}", err)?;
    }
    Ok(())
}
