//! End-to-end resolver tests over real directory trees.

use camino::{Utf8Path, Utf8PathBuf};
use lx_deps::FileStatCache;
use lx_resolve::{
    resolve, DirectiveCache, IncludeMemoCache, MacroDef, ResolveError, ResolveOptions, SearchPaths,
};
use lx_scan::Token;

struct Tree {
    _dir: tempfile::TempDir,
    root: Utf8PathBuf,
}

impl Tree {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        Self { _dir: dir, root }
    }

    fn write(&self, rel: &str, content: &str) -> Utf8PathBuf {
        let path = self.root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        path
    }

    fn search(&self, system: &[&str]) -> SearchPaths {
        SearchPaths {
            quote: vec![],
            system: system.iter().map(|s| self.root.join(s)).collect(),
            after: vec![],
        }
    }
}

fn run(
    primary: &Utf8Path,
    macros: Vec<MacroDef>,
    search: &SearchPaths,
    options: &ResolveOptions,
) -> Result<Vec<String>, ResolveError> {
    let resolved = resolve(
        primary,
        macros,
        search,
        options,
        &FileStatCache::new(),
        &DirectiveCache::new(256),
        &IncludeMemoCache::new(),
    )?;
    Ok(resolved
        .files
        .iter()
        .map(|p| p.file_name().unwrap().to_string())
        .collect())
}

#[test]
fn transitive_includes_in_visitation_order() {
    let t = Tree::new();
    let main = t.write("src/main.cc", "#include \"a.h\"\n#include \"b.h\"\n");
    t.write("src/a.h", "#include \"c.h\"\n");
    t.write("src/b.h", "int b();\n");
    t.write("src/c.h", "int c();\n");

    let files = run(&main, vec![], &t.search(&[]), &ResolveOptions::default()).unwrap();
    assert_eq!(files, vec!["main.cc", "a.h", "c.h", "b.h"]);
}

#[test]
fn angle_skips_quote_dirs_and_current_dir() {
    let t = Tree::new();
    // same header name in the source dir and in a system dir
    let main = t.write("src/main.cc", "#include <h.h>\n#include \"h.h\"\n");
    t.write("src/h.h", "// local\n");
    t.write("sys/h.h", "// system\n");

    let search = t.search(&["sys"]);
    let resolved = resolve(
        &main,
        vec![],
        &search,
        &ResolveOptions::default(),
        &FileStatCache::new(),
        &DirectiveCache::new(256),
        &IncludeMemoCache::new(),
    )
    .unwrap();

    // <h.h> found the system copy, "h.h" the sibling; both are inputs
    let names: Vec<String> = resolved
        .files
        .iter()
        .map(|p| p.as_str().to_string())
        .collect();
    assert_eq!(names.len(), 3);
    assert!(names[1].contains("sys"));
    assert!(names[2].contains("src"));
}

#[test]
fn pragma_once_and_guard_dedup() {
    let t = Tree::new();
    let main = t.write(
        "src/main.cc",
        "#include \"once.h\"\n#include \"once.h\"\n#include \"guard.h\"\n#include \"guard.h\"\n",
    );
    t.write("src/once.h", "#pragma once\n#include \"inner.h\"\n");
    t.write(
        "src/guard.h",
        "#ifndef GUARD_H\n#define GUARD_H\n#include \"inner.h\"\n#endif\n",
    );
    t.write("src/inner.h", "#pragma once\nint i();\n");

    let files = run(&main, vec![], &t.search(&[]), &ResolveOptions::default()).unwrap();
    assert_eq!(files, vec!["main.cc", "once.h", "inner.h", "guard.h"]);
}

#[test]
fn conditional_selects_include() {
    let t = Tree::new();
    let main = t.write(
        "src/main.cc",
        "#if defined(USE_FAST)\n#include \"fast.h\"\n#else\n#include \"slow.h\"\n#endif\n",
    );
    t.write("src/fast.h", "f\n");
    t.write("src/slow.h", "s\n");

    let without = run(&main, vec![], &t.search(&[]), &ResolveOptions::default()).unwrap();
    assert_eq!(without, vec!["main.cc", "slow.h"]);

    let with = run(
        &main,
        vec![MacroDef::object("USE_FAST", vec![Token::int(1)])],
        &t.search(&[]),
        &ResolveOptions::default(),
    )
    .unwrap();
    assert_eq!(with, vec!["main.cc", "fast.h"]);
}

#[test]
fn computed_include_through_macro() {
    let t = Tree::new();
    let main = t.write(
        "src/main.cc",
        "#define HEADER \"picked.h\"\n#include HEADER\n",
    );
    t.write("src/picked.h", "p\n");

    let files = run(&main, vec![], &t.search(&[]), &ResolveOptions::default()).unwrap();
    assert_eq!(files, vec!["main.cc", "picked.h"]);
}

#[test]
fn include_next_resumes_search() {
    let t = Tree::new();
    // wrapper.h in sys1 wraps the real header in sys2 via include_next
    let main = t.write("src/main.cc", "#include <wrap.h>\n");
    t.write("sys1/wrap.h", "#include_next <wrap.h>\n");
    t.write("sys2/wrap.h", "real\n");

    let resolved = resolve(
        &main,
        vec![],
        &t.search(&["sys1", "sys2"]),
        &ResolveOptions::default(),
        &FileStatCache::new(),
        &DirectiveCache::new(256),
        &IncludeMemoCache::new(),
    )
    .unwrap();

    let names: Vec<String> = resolved
        .files
        .iter()
        .map(|p| p.as_str().to_string())
        .collect();
    assert_eq!(names.len(), 3);
    assert!(names[1].contains("sys1"));
    assert!(names[2].contains("sys2"));
}

#[test]
fn missing_include_warns_or_fails() {
    let t = Tree::new();
    let main = t.write("src/main.cc", "#include \"nope.h\"\nint main() {}\n");

    let resolved = resolve(
        &main,
        vec![],
        &t.search(&[]),
        &ResolveOptions::default(),
        &FileStatCache::new(),
        &DirectiveCache::new(256),
        &IncludeMemoCache::new(),
    )
    .unwrap();
    assert_eq!(resolved.files.len(), 1);
    assert_eq!(resolved.warnings.len(), 1);
    assert!(resolved.warnings[0].contains("nope.h"));

    let err = run(
        &main,
        vec![],
        &t.search(&[]),
        &ResolveOptions {
            fatal_missing: true,
        },
    )
    .unwrap_err();
    assert!(matches!(err, ResolveError::IncludeNotFound(name) if name == "nope.h"));
}

#[test]
fn parse_error_directive_aborts() {
    let t = Tree::new();
    let main = t.write("src/main.cc", "#define FOO(a,a) a\nint main() {}\n");

    let err = run(&main, vec![], &t.search(&[]), &ResolveOptions::default()).unwrap_err();
    assert!(matches!(err, ResolveError::ParseError(msg) if msg.contains("duplicate")));
}

#[test]
fn memoized_second_resolution_matches() {
    let t = Tree::new();
    let a = t.write("src/a.cc", "#include \"shared.h\"\n");
    let b = t.write("src/b.cc", "#include \"shared.h\"\n");
    t.write(
        "src/shared.h",
        "#pragma once\n#ifdef OPT\n#include \"opt.h\"\n#endif\n#include \"base.h\"\n",
    );
    t.write("src/opt.h", "o\n");
    t.write("src/base.h", "b\n");

    let search = t.search(&[]);
    let dcache = DirectiveCache::new(256);
    let memo = IncludeMemoCache::new();

    let first = resolve(
        &a,
        vec![],
        &search,
        &ResolveOptions::default(),
        &FileStatCache::new(),
        &dcache,
        &memo,
    )
    .unwrap();
    // second translation unit replays shared.h from the memo
    let second = resolve(
        &b,
        vec![],
        &search,
        &ResolveOptions::default(),
        &FileStatCache::new(),
        &dcache,
        &memo,
    )
    .unwrap();

    let names = |r: &lx_resolve::Resolved| {
        r.files
            .iter()
            .map(|p| p.file_name().unwrap().to_string())
            .collect::<Vec<_>>()
    };
    assert_eq!(names(&first), vec!["a.cc", "shared.h", "base.h"]);
    assert_eq!(names(&second), vec!["b.cc", "shared.h", "base.h"]);

    // a different incoming macro state must not reuse the memo blindly
    let with_opt = resolve(
        &a,
        vec![MacroDef::object("OPT", vec![Token::int(1)])],
        &search,
        &ResolveOptions::default(),
        &FileStatCache::new(),
        &dcache,
        &memo,
    )
    .unwrap();
    assert_eq!(
        names(&with_opt),
        vec!["a.cc", "shared.h", "opt.h", "base.h"]
    );
}

#[test]
fn import_visits_once() {
    let t = Tree::new();
    let main = t.write("src/main.mm", "#import \"o.h\"\n#import \"o.h\"\n");
    t.write("src/o.h", "#include \"u.h\"\n");
    t.write("src/u.h", "#pragma once\n");

    let files = run(&main, vec![], &t.search(&[]), &ResolveOptions::default()).unwrap();
    assert_eq!(files, vec!["main.mm", "o.h", "u.h"]);
}

#[test]
fn has_include_selects_the_available_header() {
    let t = Tree::new();
    let main = t.write(
        "src/main.cc",
        "#if __has_include(<optional.h>)\n#include <optional.h>\n#else\n#include \"shim.h\"\n#endif\n",
    );
    t.write("src/shim.h", "s\n");

    // header absent: the shim is used
    let files = run(&main, vec![], &t.search(&["sys"]), &ResolveOptions::default()).unwrap();
    assert_eq!(files, vec!["main.cc", "shim.h"]);

    // header present: picked up through the same condition
    t.write("sys/optional.h", "o\n");
    let files = run(&main, vec![], &t.search(&["sys"]), &ResolveOptions::default()).unwrap();
    assert_eq!(files, vec!["main.cc", "optional.h"]);
}

#[test]
fn has_include_quote_form_checks_sibling_headers() {
    let t = Tree::new();
    let main = t.write(
        "src/main.cc",
        "#if __has_include(\"near.h\")\n#include \"near.h\"\n#endif\nint main() {}\n",
    );
    t.write("src/near.h", "n\n");

    let files = run(&main, vec![], &t.search(&[]), &ResolveOptions::default()).unwrap();
    assert_eq!(files, vec!["main.cc", "near.h"]);
}
