use crate::error::{Error, Result};
use crate::net::RuleAction;

/// Mount rule; every string is an optional glob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct MountRule {
    pub action: RuleAction,
    pub flags: u32,
    pub source: Option<String>,
    pub target: Option<String>,
    pub fstype: Option<String>,
    pub options: Option<String>,
}

impl MountRule {
    pub fn new(action: RuleAction) -> Self {
        Self {
            action,
            ..Self::default()
        }
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_fstype(mut self, fstype: impl Into<String>) -> Self {
        self.fstype = Some(fstype.into());
        self
    }

    pub fn with_options(mut self, options: impl Into<String>) -> Self {
        self.options = Some(options.into());
        self
    }

    pub(crate) fn strings(&self) -> [&Option<String>; 4] {
        [&self.source, &self.target, &self.fstype, &self.options]
    }

    pub(crate) fn check(&self) -> std::result::Result<(), &'static str> {
        for value in self.strings().into_iter().flatten() {
            if value.is_empty() {
                return Err("mount rule strings must not be empty");
            }
            if value.contains('\0') {
                return Err("mount rule strings must not contain NUL");
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.check().map_err(|reason| Error::InvalidArgument(reason.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interior_nul_is_rejected() {
        let rule = MountRule::new(RuleAction::Deny).with_target("/mnt\0x");
        assert!(rule.validate().is_err());
    }

    #[test]
    fn builder_sets_fields() {
        let rule = MountRule::new(RuleAction::Allow)
            .with_flags(0x1000)
            .with_source("tmpfs")
            .with_target("/tmp/**")
            .with_fstype("tmpfs");
        rule.validate().unwrap();
        assert_eq!(rule.flags, 0x1000);
        assert!(rule.options.is_none());
    }
}
