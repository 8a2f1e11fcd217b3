//! Minimal gcc/clang-style flag inspection.
//!
//! Full compiler-flag parsing belongs to the wrapper side; the daemon only
//! needs what steers the compile task: the primary sources, the outputs,
//! the include search configuration, command-line macros, and whether the
//! invocation links.

use camino::Utf8PathBuf;
use lx_resolve::{MacroDef, SearchPaths};
use lx_scan::stream::ByteStream;
use lx_scan::tokenizer::next_token;
use lx_scan::Token;

/// What the task needs to know about an argument list.
#[derive(Debug, Clone, Default)]
pub struct CompileFlags {
    /// Translation units named on the command line
    pub sources: Vec<Utf8PathBuf>,
    /// Output files (`-o`, plus `-MF` depfiles)
    pub outputs: Vec<Utf8PathBuf>,
    pub search: SearchPaths,
    /// `-D`/`-U` in order
    pub initial_macros: Vec<MacroDef>,
    /// No `-c`/`-S`/`-E`: the link step runs, and inputs include objects
    pub linking: bool,
}

const SOURCE_SUFFIXES: [&str; 8] = ["c", "cc", "cpp", "cxx", "m", "mm", "s", "S"];

fn is_source(arg: &str) -> bool {
    let path = Utf8PathBuf::from(arg);
    match path.extension() {
        Some(ext) => SOURCE_SUFFIXES.contains(&ext),
        None => false,
    }
}

/// Parse `-DNAME` / `-DNAME=value` into a macro definition. Function-like
/// `-D` (`-DF(x)=x`) is rare; values are lexed the same way a `#define`
/// body would be.
fn parse_define(spec: &str) -> MacroDef {
    let (name, value) = match spec.split_once('=') {
        Some((n, v)) => (n, v),
        // -DNAME means NAME expands to 1
        None => (spec, "1"),
    };

    let mut stream = ByteStream::new(value.as_bytes());
    let mut replacement = Vec::new();
    while let Ok(token) = next_token(&mut stream, false) {
        if token == Token::End || token == Token::Newline {
            break;
        }
        replacement.push(token);
    }

    MacroDef::object(name, replacement)
}

/// Inspect a gcc-style argument list (argv[0] included).
pub fn parse_gcc_style(args: &[String]) -> CompileFlags {
    let mut flags = CompileFlags::default();
    let mut compile_only = false;
    let mut explicit_output = None;

    let mut iter = args.iter().skip(1).peekable();
    while let Some(arg) = iter.next() {
        let mut take_value = |inline: &str| -> Option<String> {
            if !inline.is_empty() {
                Some(inline.to_string())
            } else {
                iter.next().cloned()
            }
        };

        match arg.as_str() {
            "-c" | "-S" | "-E" => compile_only = true,
            _ if arg == "-o" || arg.starts_with("-o") && arg.len() > 2 => {
                if let Some(v) = take_value(&arg[2..]) {
                    explicit_output = Some(Utf8PathBuf::from(v));
                }
            }
            "-MF" => {
                if let Some(v) = take_value("") {
                    flags.outputs.push(Utf8PathBuf::from(v));
                }
            }
            _ if arg == "-I" || (arg.starts_with("-I") && arg.len() > 2) => {
                if let Some(v) = take_value(&arg[2..]) {
                    flags.search.system.push(Utf8PathBuf::from(v));
                }
            }
            "-isystem" => {
                if let Some(v) = take_value("") {
                    flags.search.system.push(Utf8PathBuf::from(v));
                }
            }
            "-iquote" => {
                if let Some(v) = take_value("") {
                    flags.search.quote.push(Utf8PathBuf::from(v));
                }
            }
            "-idirafter" => {
                if let Some(v) = take_value("") {
                    flags.search.after.push(Utf8PathBuf::from(v));
                }
            }
            _ if arg == "-D" || (arg.starts_with("-D") && arg.len() > 2) => {
                if let Some(v) = take_value(&arg[2..]) {
                    flags.initial_macros.push(parse_define(&v));
                }
            }
            _ if arg == "-U" || (arg.starts_with("-U") && arg.len() > 2) => {
                // a later resolver pass applies these in order; model as a
                // define-with-no-body removal by filtering earlier defines
                if let Some(v) = take_value(&arg[2..]) {
                    flags.initial_macros.retain(|m| m.name != v);
                }
            }
            _ if arg.starts_with('-') => {
                // other flags don't affect input discovery
            }
            _ if is_source(arg) => flags.sources.push(Utf8PathBuf::from(arg)),
            _ => {
                // objects/archives on the command line mean a link step
                if arg.ends_with(".o") || arg.ends_with(".a") || arg.ends_with(".obj") {
                    flags.linking = true;
                }
            }
        }
    }

    flags.linking |= !compile_only;

    match explicit_output {
        Some(output) => flags.outputs.insert(0, output),
        None => {
            // default object names for -c; a link defaults to a.out
            if compile_only {
                for source in &flags.sources {
                    flags.outputs.push(source.with_extension("o"));
                }
            } else {
                flags.outputs.insert(0, Utf8PathBuf::from("a.out"));
            }
        }
    }

    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn compile_invocation() {
        let flags = parse_gcc_style(&argv(&[
            "clang++", "-c", "src/a.cc", "-o", "out/a.o", "-Iinclude", "-isystem", "/usr/lib/x",
            "-DNDEBUG", "-DVERSION=3",
        ]));
        assert_eq!(flags.sources, vec![Utf8PathBuf::from("src/a.cc")]);
        assert_eq!(flags.outputs, vec![Utf8PathBuf::from("out/a.o")]);
        assert!(!flags.linking);
        assert_eq!(flags.search.system.len(), 2);
        assert_eq!(flags.initial_macros.len(), 2);
        assert_eq!(flags.initial_macros[0].name, "NDEBUG");
        assert_eq!(flags.initial_macros[0].replacement, vec![Token::int(1)]);
        assert_eq!(flags.initial_macros[1].replacement, vec![Token::int(3)]);
    }

    #[test]
    fn link_invocation_is_heavy() {
        let flags = parse_gcc_style(&argv(&["clang++", "a.o", "b.o", "-o", "prog"]));
        assert!(flags.linking);
        assert_eq!(flags.outputs, vec![Utf8PathBuf::from("prog")]);
        assert!(flags.sources.is_empty());
    }

    #[test]
    fn default_object_name() {
        let flags = parse_gcc_style(&argv(&["cc", "-c", "x.c"]));
        assert_eq!(flags.outputs, vec![Utf8PathBuf::from("x.o")]);
    }

    #[test]
    fn undef_removes_earlier_define() {
        let flags = parse_gcc_style(&argv(&["cc", "-c", "x.c", "-DFOO", "-UFOO", "-DBAR"]));
        assert_eq!(flags.initial_macros.len(), 1);
        assert_eq!(flags.initial_macros[0].name, "BAR");
    }

    #[test]
    fn attached_and_detached_values() {
        let a = parse_gcc_style(&argv(&["cc", "-c", "x.c", "-I", "dir"]));
        let b = parse_gcc_style(&argv(&["cc", "-c", "x.c", "-Idir"]));
        assert_eq!(a.search.system, b.search.system);
    }
}
