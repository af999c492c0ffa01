//! The file driver.
//!
//! Walks a configured search path, resolves namespace names to source files,
//! feeds top-level forms from a reader through the core, and writes each
//! compiled namespace to its Dart output file.  The reader itself is behind
//! [`FormSource`]; producing forms from text is someone else's job.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use crate::analyze;
use crate::context::CompilerContext;
use crate::error::{CompileError, ErrorKind, Result};
use crate::form::Form;

/// Extensions tried when resolving a namespace to a file: the plain source
/// extension first, then the cross-platform variant.
pub const SOURCE_EXT: &str = "lts";
pub const PORTABLE_EXT: &str = "ltc";

/// The reader contract: a stream of top-level surface forms.  `Ok(None)` is
/// the end-of-input sentinel.
pub trait FormSource {
    fn next_form(&mut self) -> Result<Option<Form>>;
}

/// Pre-read forms (handy for tests and embedders with their own reader).
impl FormSource for std::vec::IntoIter<Form> {
    fn next_form(&mut self) -> Result<Option<Form>> {
        Ok(self.next())
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Directories searched, in order, for namespace source files.
    pub search_path: Vec<PathBuf>,
    /// Destination directory of the build.
    pub dest: PathBuf,
    /// Subdirectory of `dest` receiving generated Dart files.
    pub gen_dir: String,
}

impl Config {
    pub fn new(dest: impl Into<PathBuf>) -> Self {
        Config { search_path: vec![], dest: dest.into(), gen_dir: "lib".into() }
    }

    pub fn search(mut self, dir: impl Into<PathBuf>) -> Self {
        self.search_path.push(dir.into());
        self
    }

    pub fn gen_dir(mut self, dir: &str) -> Self {
        self.gen_dir = dir.into();
        self
    }
}

pub struct Driver {
    config: Config,
    pub ctx: CompilerContext,
}

impl Driver {
    pub fn new(config: Config) -> Self {
        Driver { config, ctx: CompilerContext::new() }
    }

    /// Resolve a namespace name to a source file: `a.b-c.d` maps to
    /// `a/b_c/d` with each extension, first match on the search path wins.
    pub fn find_source(&self, ns_name: &str) -> Option<PathBuf> {
        let rel = ns_name.replace('.', "/").replace('-', "_");
        for dir in &self.config.search_path {
            for ext in [SOURCE_EXT, PORTABLE_EXT] {
                let candidate = dir.join(format!("{}.{}", rel, ext));
                if candidate.is_file() {
                    return Some(candidate);
                }
            }
        }
        None
    }

    /// Feed every form from the reader through the core.  The first error
    /// aborts this compilation; nothing written so far is rolled back.
    pub fn compile(&mut self, source: &mut dyn FormSource) -> Result<()> {
        while let Some(form) = source.next_form()? {
            analyze::compile_top(&mut self.ctx, &form)?;
        }
        Ok(())
    }

    /// Compile a whole stream and write out the namespace it defined,
    /// reporting any failure on stderr before returning it.
    pub fn compile_and_write(&mut self, source: &mut dyn FormSource) -> Result<PathBuf> {
        let outcome = self
            .compile(source)
            .and_then(|()| self.write_namespace(&self.ctx.nses.current_name().to_owned()));
        if let Err(e) = &outcome {
            eprintln!(
                "error compiling namespace {}: {}",
                self.ctx.nses.current_name(),
                e
            );
        }
        outcome
    }

    /// Output file path of a namespace.
    pub fn output_path(&self, ns_name: &str) -> PathBuf {
        let lib = crate::nses::lib_for_ns(ns_name);
        self.config.dest.join(&self.config.gen_dir).join(lib)
    }

    /// Write one compiled namespace: import directives for every recorded
    /// import, then each definition's pre-rendered source.  The file is
    /// flushed and closed whether or not writing succeeds part-way.
    pub fn write_namespace(&self, ns_name: &str) -> Result<PathBuf> {
        let ns = self.ctx.nses.get(ns_name).ok_or_else(|| {
            CompileError::new(ErrorKind::UnknownSymbol(ns_name.to_owned()), "write-namespace")
        })?;

        let path = self.output_path(ns_name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // BufWriter + File both close on drop, error path included.
        let mut out = BufWriter::new(fs::File::create(&path)?);

        for (alias, import) in &ns.imports {
            writeln!(out, "import '{}' as {};", import.lib, alias)?;
        }
        if !ns.imports.is_empty() {
            writeln!(out)?;
        }
        for def in ns.defs.values() {
            if def.source.is_empty() {
                continue;
            }
            out.write_all(def.source.as_bytes())?;
            writeln!(out)?;
        }
        out.flush()?;
        Ok(path)
    }
}

// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::form::build::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("lotus-driver-{}-{}", std::process::id(), tag));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn source_resolution_prefers_plain_extension() {
        let dir = temp_dir("search");
        fs::create_dir_all(dir.join("app")).unwrap();
        fs::write(dir.join("app/main.lts"), "").unwrap();
        fs::write(dir.join("app/main.ltc"), "").unwrap();
        fs::write(dir.join("app/extra.ltc"), "").unwrap();

        let driver = Driver::new(Config::new("out").search(&dir));
        assert_eq!(driver.find_source("app.main").unwrap(), dir.join("app/main.lts"));
        assert_eq!(driver.find_source("app.extra").unwrap(), dir.join("app/extra.ltc"));
        assert!(driver.find_source("app.missing").is_none());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn output_path_mangles_namespace_name() {
        let driver = Driver::new(Config::new("/build").gen_dir("gen"));
        assert_eq!(
            driver.output_path("my-app.sub.core"),
            PathBuf::from("/build/gen/my_app/sub/core.dart")
        );
    }

    #[test]
    fn compile_and_write_round_trip() {
        let dir = temp_dir("write");
        let mut driver = Driver::new(Config::new(&dir));

        let forms = vec![
            list([sym("ns"), sym("app.main")]),
            list([sym("def"), sym("greeting"), string("hello")]),
            list([
                sym("def"),
                sym("shout"),
                list([
                    sym("fn*"),
                    vector([sym("s")]),
                    list([sym("."), sym("s"), sym("toUpperCase")]),
                ]),
            ]),
        ];
        let path = driver.compile_and_write(&mut forms.into_iter()).unwrap();
        assert_eq!(path, dir.join("lib/app/main.dart"));

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("final greeting = \"hello\";"), "{}", text);
        assert!(text.contains("dynamic shout("), "{}", text);

        fs::remove_dir_all(&dir).unwrap();
    }
}
