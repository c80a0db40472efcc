//! Dependency vectors: validation.
//!
//! 設計：
//! - 各 work package の先行は高々 1 つ（グラフは鎖の集まりで、各ノードの出辺は高々 1 本）
//! - 始点に戻る鎖はメンバー全員を永久に止めるので、書き込み前にサイクルを拒否する

use thiserror::Error;

use crate::domain::WpNumber;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DependencyError {
    #[error("expected {expected} entries, got {got}")]
    WrongLength { expected: usize, got: usize },

    #[error("{wp} depends on {target}, which is outside the task")]
    OutOfRange { wp: WpNumber, target: WpNumber },

    #[error("{0} depends on itself")]
    SelfDependency(WpNumber),

    #[error("dependency cycle: {}", format_cycle(.0))]
    Cycle(Vec<WpNumber>),
}

fn format_cycle(cycle: &[WpNumber]) -> String {
    cycle
        .iter()
        .map(WpNumber::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Check a full dependency vector (index `i` holds the predecessor of
/// work package `i + 1`) against a task of `wp_total` packages.
pub fn validate(depends: &[Option<WpNumber>], wp_total: usize) -> Result<(), DependencyError> {
    if depends.len() != wp_total {
        return Err(DependencyError::WrongLength {
            expected: wp_total,
            got: depends.len(),
        });
    }

    for (index, target) in depends.iter().enumerate() {
        let (Some(wp), Some(target)) = (WpNumber::from_index(index), *target) else {
            continue;
        };
        if target.index() >= wp_total {
            return Err(DependencyError::OutOfRange { wp, target });
        }
        if target == wp {
            return Err(DependencyError::SelfDependency(wp));
        }
    }

    match find_cycle(depends) {
        Some(cycle) => Err(DependencyError::Cycle(cycle)),
        None => Ok(()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    /// Not visited yet.
    White,
    /// On the walk currently in progress.
    Gray,
    /// Fully explored; no cycle reachable from here.
    Black,
}

/// Find one cycle, returned in walk order starting at its entry point.
///
/// Linear time: every node turns Gray once and Black once. Targets outside
/// the vector end a walk.
pub fn find_cycle(depends: &[Option<WpNumber>]) -> Option<Vec<WpNumber>> {
    let mut color = vec![Color::White; depends.len()];

    for start in 0..depends.len() {
        if color[start] != Color::White {
            continue;
        }

        let mut path = Vec::new();
        let mut node = start;
        loop {
            match color[node] {
                Color::Black => break,
                Color::Gray => {
                    // Gray nodes all belong to the current path.
                    let entry = path.iter().position(|&n| n == node).unwrap_or(0);
                    return Some(
                        path[entry..]
                            .iter()
                            .filter_map(|&i| WpNumber::from_index(i))
                            .collect(),
                    );
                }
                Color::White => {
                    color[node] = Color::Gray;
                    path.push(node);
                    match depends[node].map(WpNumber::index) {
                        Some(next) if next < depends.len() => node = next,
                        _ => break,
                    }
                }
            }
        }

        for n in path {
            color[n] = Color::Black;
        }
    }
    None
}
