//! Context compaction.
//!
//! Rewrites the append-only log of executed fragments into a minimal
//! equivalent program: identical imports deduplicated (first occurrence
//! wins), assignments to the same top-level name superseded by the latest,
//! statements that only created an item whose binding no longer names a
//! live one elided, and method-call groups per target superseded by the
//! latest group. Deterministic for equal input; a block that fails to
//! parse makes the whole compaction fall back to raw concatenation.

use std::collections::{BTreeMap, BTreeSet};

use crate::exec::parser::{self, StmtKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Class {
    Import,
    Assign,
    SideEffect,
    Other,
}

struct Analyzed {
    source: String,
    version: usize,
    index: usize,
    class: Class,
    defines: BTreeSet<String>,
    reads: BTreeSet<String>,
    /// Method-call root for side effects (`box.set_pos(...)` → `box`).
    target: Option<String>,
    /// Whitespace-normalized source, for import dedup.
    normalized: String,
    /// True when the statement's expression constructs a scene item.
    creates_item: bool,
}

fn normalize(source: &str) -> String {
    source.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn analyze(blocks: &[String]) -> Result<Vec<Analyzed>, String> {
    let mut out = Vec::new();
    for (version, block) in blocks.iter().enumerate() {
        if block.trim().is_empty() {
            continue;
        }
        let stmts = parser::parse_program(block)?;
        for (index, stmt) in stmts.into_iter().enumerate() {
            let mut defines = BTreeSet::new();
            let mut reads_vec = Vec::new();
            let mut target = None;
            let mut creates_item = false;
            let class = match &stmt.kind {
                StmtKind::Import { module } => {
                    defines.insert(module.clone());
                    Class::Import
                }
                StmtKind::Assign { name, expr } => {
                    defines.insert(name.clone());
                    expr.collect_reads(&mut reads_vec);
                    creates_item = expr.creates_item();
                    Class::Assign
                }
                StmtKind::Expr(expr) => {
                    expr.collect_reads(&mut reads_vec);
                    creates_item = expr.creates_item();
                    target = expr.method_root().map(str::to_string);
                    if target.is_some() {
                        Class::SideEffect
                    } else {
                        Class::Other
                    }
                }
            };
            out.push(Analyzed {
                normalized: normalize(&stmt.source),
                source: stmt.source,
                version,
                index,
                class,
                defines,
                reads: reads_vec.into_iter().collect(),
                target,
                creates_item,
            });
        }
    }
    Ok(out)
}

pub struct CodeCompactor;

impl CodeCompactor {
    /// Compact `blocks`. `binding_live(name)` answers whether `name` still
    /// refers to a live scene item in the latest namespace; creations whose
    /// bindings died are dropped. Returns None when any block fails to
    /// parse.
    pub fn compact(
        &self,
        blocks: &[String],
        binding_live: &dyn Fn(&str) -> bool,
    ) -> Option<String> {
        let stmts = analyze(blocks).ok()?;
        if stmts.is_empty() {
            return Some(String::new());
        }

        // Latest definition site per name.
        let mut latest_def: BTreeMap<String, (usize, usize)> = BTreeMap::new();
        for s in &stmts {
            if s.class == Class::Assign {
                for name in &s.defines {
                    latest_def.insert(name.clone(), (s.version, s.index));
                }
            }
        }

        // Latest block touching each side-effect target.
        let mut latest_effect: BTreeMap<String, usize> = BTreeMap::new();
        for s in &stmts {
            if s.class == Class::SideEffect {
                if let Some(t) = &s.target {
                    let v = latest_effect.entry(t.clone()).or_insert(s.version);
                    *v = (*v).max(s.version);
                }
            }
        }

        // Which block holds each name's live definition.
        let def_version: BTreeMap<&String, usize> =
            latest_def.iter().map(|(n, (v, _))| (n, *v)).collect();

        let mut seen_imports = BTreeSet::new();
        let mut imports: Vec<&Analyzed> = Vec::new();
        let mut body: Vec<&Analyzed> = Vec::new();

        for s in &stmts {
            match s.class {
                Class::Import => {
                    if seen_imports.insert(s.normalized.clone()) {
                        imports.push(s);
                    }
                }
                Class::Assign => {
                    let is_latest = s
                        .defines
                        .iter()
                        .any(|n| latest_def.get(n) == Some(&(s.version, s.index)));
                    if !is_latest {
                        continue;
                    }
                    // Superseded creations of dead items vanish entirely.
                    if s.creates_item && s.defines.iter().all(|n| !binding_live(n)) {
                        continue;
                    }
                    body.push(s);
                }
                Class::SideEffect => {
                    let target = s.target.as_ref().unwrap();
                    let is_latest_group = latest_effect.get(target) == Some(&s.version);
                    // Effects co-located with their target's live definition
                    // are initialization code and travel with it.
                    let is_init = def_version.get(target) == Some(&s.version);
                    if is_latest_group || is_init {
                        body.push(s);
                    }
                }
                Class::Other => body.push(s),
            }
        }

        // Prune imports no surviving statement references.
        let mut live_names: BTreeSet<&String> = BTreeSet::new();
        for s in &body {
            live_names.extend(s.reads.iter());
            live_names.extend(s.defines.iter());
        }
        imports.retain(|s| {
            s.defines
                .iter()
                .any(|m| live_names.contains(m) || live_names.contains(&root_of(m)))
        });

        let mut parts: Vec<String> = Vec::new();
        if !imports.is_empty() {
            parts.push(
                imports
                    .iter()
                    .map(|s| s.source.clone())
                    .collect::<Vec<_>>()
                    .join("\n"),
            );
        }
        if !body.is_empty() {
            let mut lines = Vec::new();
            let mut prev_version = usize::MAX;
            for s in &body {
                if s.version != prev_version && !lines.is_empty() {
                    lines.push(String::new());
                }
                lines.push(s.source.clone());
                prev_version = s.version;
            }
            parts.push(lines.join("\n"));
        }

        if parts.is_empty() {
            Some(String::new())
        } else {
            Some(parts.join("\n\n") + "\n")
        }
    }
}

fn root_of(module: &str) -> String {
    module.split('.').next().unwrap_or(module).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compact(blocks: &[&str]) -> String {
        CodeCompactor
            .compact(
                &blocks.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
                &|_| true,
            )
            .unwrap()
    }

    #[test]
    fn assignments_superseded_by_latest() {
        let out = compact(&["x = 1\ny = 2\n", "x = 10\n"]);
        assert!(out.contains("x = 10"));
        assert!(!out.contains("x = 1\n"));
        assert!(out.contains("y = 2"));
    }

    #[test]
    fn imports_dedup_first_occurrence() {
        let out = compact(&["import math\nx = math\n", "import math\ny = math\n"]);
        assert_eq!(out.matches("import math").count(), 1);
        assert!(out.starts_with("import math"));
    }

    #[test]
    fn unused_imports_pruned() {
        let out = compact(&["import geometry\nx = 1\n", "x = 2\n"]);
        assert!(!out.contains("geometry"));
        assert!(out.contains("x = 2"));
    }

    #[test]
    fn side_effect_groups_latest_wins() {
        let out = compact(&[
            "obj = rect(0, 0, 10, 10)\n",
            "obj.set_color('#AAA111')\n",
            "obj.set_color('#BBB222')\n",
        ]);
        assert!(out.contains("#BBB222"));
        assert!(!out.contains("#AAA111"));
        assert!(out.contains("obj = rect"));
    }

    #[test]
    fn init_effects_travel_with_definition() {
        let out = compact(&[
            "w = rect(0, 0, 1, 1)\nw.set_color('#111111')\n",
            "z = 4\n",
        ]);
        assert!(out.contains("w.set_color('#111111')"));
    }

    #[test]
    fn dead_item_creation_elided() {
        let blocks: Vec<String> = vec![
            "ghost = rect(0, 0, 5, 5)\n".to_string(),
            "keep = rect(1, 1, 5, 5)\n".to_string(),
        ];
        let out = CodeCompactor
            .compact(&blocks, &|name| name == "keep")
            .unwrap();
        assert!(!out.contains("ghost"));
        assert!(out.contains("keep = rect"));
    }

    #[test]
    fn deterministic_for_equal_input() {
        let blocks = ["import math\na = 1\n", "a = 2\nmath_val = math\n"];
        assert_eq!(compact(&blocks), compact(&blocks));
    }

    #[test]
    fn parse_failure_yields_none() {
        let blocks = vec!["x = = 1\n".to_string()];
        assert!(CodeCompactor.compact(&blocks, &|_| true).is_none());
    }
}
