//! Skill hierarchy
//!
//! Skills form a forest: each skill has at most one parent, ids are assigned
//! sequentially from 1 and a parent always has a smaller id than its children.
//! Replay needs the ancestors (nearest first) and the full set of descendants
//! (ascending id) of a skill.

use crate::error::{MinerError, Result};
use serde::{Deserialize, Serialize};

/// One skill as reported by the ledger
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Skill {
    pub id: u64,
    pub parent: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillTree {
    /// `parents[i]` is the parent of skill `i + 1`
    parents: Vec<Option<u64>>,
}

impl SkillTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a tree from skills listed in id order
    pub fn from_skills(skills: &[Skill]) -> Result<Self> {
        let mut tree = Self::new();
        for skill in skills {
            let id = tree.add_skill(skill.parent)?;
            if id != skill.id {
                return Err(MinerError::Validation(format!(
                    "skill ids must be sequential: expected {}, got {}",
                    id, skill.id
                )));
            }
        }
        Ok(tree)
    }

    /// Add a skill under `parent`, returning the new id
    pub fn add_skill(&mut self, parent: Option<u64>) -> Result<u64> {
        if let Some(parent) = parent {
            if !self.contains(parent) {
                return Err(MinerError::NotFound(format!("parent skill {}", parent)));
            }
        }
        self.parents.push(parent);
        Ok(self.parents.len() as u64)
    }

    pub fn len(&self) -> u64 {
        self.parents.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn contains(&self, skill_id: u64) -> bool {
        skill_id >= 1 && skill_id <= self.len()
    }

    pub fn get(&self, skill_id: u64) -> Option<Skill> {
        self.contains(skill_id).then(|| Skill {
            id: skill_id,
            parent: self.parents[(skill_id - 1) as usize],
        })
    }

    pub fn parent(&self, skill_id: u64) -> Option<u64> {
        self.get(skill_id).and_then(|s| s.parent)
    }

    /// Ancestors of `skill_id`, nearest first
    pub fn ancestors(&self, skill_id: u64) -> Vec<u64> {
        let mut out = Vec::new();
        let mut current = self.parent(skill_id);
        while let Some(id) = current {
            out.push(id);
            current = self.parent(id);
        }
        out
    }

    /// All descendants of `skill_id` in ascending id order
    pub fn descendants(&self, skill_id: u64) -> Vec<u64> {
        if !self.contains(skill_id) {
            return Vec::new();
        }
        // Parents precede children, so one forward pass is enough.
        let mut in_subtree = vec![false; self.parents.len() + 1];
        in_subtree[skill_id as usize] = true;
        let mut out = Vec::new();
        for id in (skill_id + 1)..=self.len() {
            if let Some(parent) = self.parent(id) {
                if in_subtree[parent as usize] {
                    in_subtree[id as usize] = true;
                    out.push(id);
                }
            }
        }
        out
    }

    pub fn skills(&self) -> Vec<Skill> {
        (1..=self.len()).filter_map(|id| self.get(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 1
    /// ├── 2
    /// │   └── 4
    /// └── 3
    ///     └── 5
    ///         └── 6
    /// 7
    fn sample() -> SkillTree {
        let mut tree = SkillTree::new();
        tree.add_skill(None).unwrap();
        tree.add_skill(Some(1)).unwrap();
        tree.add_skill(Some(1)).unwrap();
        tree.add_skill(Some(2)).unwrap();
        tree.add_skill(Some(3)).unwrap();
        tree.add_skill(Some(5)).unwrap();
        tree.add_skill(None).unwrap();
        tree
    }

    #[test]
    fn test_ancestors_nearest_first() {
        let tree = sample();
        assert_eq!(tree.ancestors(6), vec![5, 3, 1]);
        assert_eq!(tree.ancestors(1), Vec::<u64>::new());
        assert_eq!(tree.ancestors(99), Vec::<u64>::new());
    }

    #[test]
    fn test_descendants_ascending() {
        let tree = sample();
        assert_eq!(tree.descendants(1), vec![2, 3, 4, 5, 6]);
        assert_eq!(tree.descendants(3), vec![5, 6]);
        assert!(tree.descendants(7).is_empty());
    }

    #[test]
    fn test_unknown_parent_rejected() {
        let mut tree = SkillTree::new();
        assert!(matches!(tree.add_skill(Some(1)), Err(MinerError::NotFound(_))));
    }

    #[test]
    fn test_from_skills_roundtrip() {
        let tree = sample();
        let rebuilt = SkillTree::from_skills(&tree.skills()).unwrap();
        assert_eq!(rebuilt, tree);

        let gap = [Skill { id: 2, parent: None }];
        assert!(SkillTree::from_skills(&gap).is_err());
    }
}
