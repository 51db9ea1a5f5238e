/// Git metadata captured by `build.rs`. Absent when building outside a git checkout.
pub(crate) struct BuildInfo {
    pub(crate) commit_sha1: Option<&'static str>,
    git_dirty: Option<&'static str>,
}

impl BuildInfo {
    pub(crate) fn is_dirty(&self) -> bool {
        self.git_dirty == Some("true")
    }
}

pub(crate) const BUILD_INFO: BuildInfo = BuildInfo {
    commit_sha1: option_env!("VERGEN_GIT_SHA"),
    git_dirty: option_env!("VERGEN_GIT_DIRTY"),
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirty_flag_reads_vergen_value() {
        let clean = BuildInfo {
            commit_sha1: Some("abc123"),
            git_dirty: Some("false"),
        };
        let dirty = BuildInfo {
            commit_sha1: Some("abc123"),
            git_dirty: Some("true"),
        };
        let outside_git = BuildInfo {
            commit_sha1: None,
            git_dirty: None,
        };
        assert!(!clean.is_dirty());
        assert!(dirty.is_dirty());
        assert!(!outside_git.is_dirty());
    }
}
