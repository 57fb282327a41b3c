//! `/proc/<pid>/maps` parsing.

use std::fs;
use std::path::Path;

use nix::unistd::Pid;

use crate::errors::CrashcapResult;

/// One line of a maps file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub start: u64,
    pub end: u64,
    pub perms: String,
    pub offset: u64,
    /// File path or pseudo name such as `[stack]`.
    pub path: Option<String>,
}

impl Mapping {
    pub fn readable(&self) -> bool {
        self.perms.starts_with('r')
    }

    pub fn executable(&self) -> bool {
        self.perms.as_bytes().get(2) == Some(&b'x')
    }

    pub fn private(&self) -> bool {
        self.perms.as_bytes().get(3) == Some(&b'p')
    }

    pub fn contains(&self, address: u64) -> bool {
        (self.start..self.end).contains(&address)
    }

    fn file_backed(&self) -> bool {
        self.path.as_deref().is_some_and(|path| path.starts_with('/'))
    }

    /// Kernel-provided pages that cannot be read through `/proc/<pid>/mem`.
    pub fn is_special(&self) -> bool {
        matches!(self.path.as_deref(), Some("[vvar]" | "[vvar_vclock]" | "[vsyscall]"))
    }
}

/// A loaded image, spanning every mapping of the same file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRange {
    /// Basename used in `module!symbol` expressions.
    pub name: String,
    pub path: String,
    pub base: u64,
    pub end: u64,
}

pub fn read_maps(pid: Pid) -> CrashcapResult<Vec<Mapping>> {
    let text = fs::read_to_string(format!("/proc/{pid}/maps"))?;
    Ok(parse_maps(&text))
}

/// Parse a maps file, skipping lines that do not fit the format.
pub fn parse_maps(text: &str) -> Vec<Mapping> {
    text.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<Mapping> {
    let mut fields = line.split_whitespace();
    let (start, end) = fields.next()?.split_once('-')?;
    let perms = fields.next()?.to_string();
    let offset = u64::from_str_radix(fields.next()?, 16).ok()?;
    let _device = fields.next()?;
    let _inode = fields.next()?;
    let path = fields.collect::<Vec<_>>().join(" ");

    Some(Mapping {
        start: u64::from_str_radix(start, 16).ok()?,
        end: u64::from_str_radix(end, 16).ok()?,
        perms,
        offset,
        path: (!path.is_empty()).then_some(path),
    })
}

/// Group file-backed mappings into modules. Only files with executable code
/// count; data files mapped by the target are skipped.
pub fn modules(maps: &[Mapping]) -> Vec<ModuleRange> {
    let mut modules: Vec<ModuleRange> = Vec::new();
    for mapping in maps.iter().filter(|m| m.file_backed()) {
        let Some(path) = mapping.path.as_deref() else {
            continue;
        };
        match modules.iter_mut().find(|module| module.path == path) {
            Some(module) => {
                module.base = module.base.min(mapping.start);
                module.end = module.end.max(mapping.end);
            }
            None => modules.push(ModuleRange {
                name: basename(path).to_string(),
                path: path.to_string(),
                base: mapping.start,
                end: mapping.end,
            }),
        }
    }

    modules.retain(|module| {
        maps.iter()
            .any(|m| m.executable() && m.path.as_deref() == Some(module.path.as_str()))
    });
    modules
}

fn basename(path: &str) -> &str {
    let path = path.strip_suffix(" (deleted)").unwrap_or(path);
    Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
55d4c2a00000-55d4c2a02000 r--p 00000000 08:01 1048602                    /usr/bin/cat
55d4c2a02000-55d4c2a07000 r-xp 00002000 08:01 1048602                    /usr/bin/cat
55d4c2a0c000-55d4c2a2d000 rw-p 00000000 00:00 0                          [heap]
7f1a3c000000-7f1a3c028000 r--p 00000000 08:01 1055384                    /usr/lib/x86_64-linux-gnu/libc.so.6
7f1a3c028000-7f1a3c1bd000 r-xp 00028000 08:01 1055384                    /usr/lib/x86_64-linux-gnu/libc.so.6
7f1a3c300000-7f1a3c400000 r--p 00000000 08:01 2000000                    /usr/share/locale/locale-archive
7f1a3c500000-7f1a3c501000 r-xp 00000000 08:01 2000001                    /tmp/my lib.so
7ffd6b1e0000-7ffd6b201000 rw-p 00000000 00:00 0                          [stack]
7ffd6b3f4000-7ffd6b3f8000 r--p 00000000 00:00 0                          [vvar]
";

    #[test]
    fn parses_every_field() {
        let maps = parse_maps(SAMPLE);
        assert_eq!(maps.len(), 9);
        assert_eq!(
            maps[1],
            Mapping {
                start: 0x55d4_c2a0_2000,
                end: 0x55d4_c2a0_7000,
                perms: "r-xp".into(),
                offset: 0x2000,
                path: Some("/usr/bin/cat".into()),
            }
        );
        assert!(maps[1].executable() && maps[1].private() && maps[1].readable());
        assert_eq!(maps[2].path.as_deref(), Some("[heap]"));
        assert!(maps[8].is_special());
    }

    #[test]
    fn paths_with_spaces_survive() {
        let maps = parse_maps(SAMPLE);
        assert_eq!(maps[6].path.as_deref(), Some("/tmp/my lib.so"));
    }

    #[test]
    fn anonymous_mappings_have_no_path() {
        let maps = parse_maps("7f00-7f10 rw-p 00000000 00:00 0\n");
        assert_eq!(maps[0].path, None);
    }

    #[test]
    fn modules_are_executable_files_only() {
        let modules = modules(&parse_maps(SAMPLE));
        let names: Vec<_> = modules.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["cat", "libc.so.6", "my lib.so"]);
        assert_eq!(modules[1].base, 0x7f1a_3c00_0000);
        assert_eq!(modules[1].end, 0x7f1a_3c1b_d000);
    }

    #[test]
    fn deleted_suffix_is_not_part_of_the_name() {
        assert_eq!(basename("/tmp/libx.so (deleted)"), "libx.so");
    }

    #[test]
    fn garbage_lines_are_skipped() {
        assert!(parse_maps("not a maps line\n\n").is_empty());
    }
}
