use bitflags::bitflags;

bitflags! {
    /// Access rights granted to paths matched by a pattern.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Permission: u32 {
        const READ = 1;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl Permission {
    /// Mask returned when no pattern accepts the input.
    pub const NONE: Self = Self::empty();

    /// Parses an access name such as `read` or `exec`.
    pub fn parse_name(name: &str) -> Option<Self> {
        match name {
            "read" | "r" => Some(Self::READ),
            "write" | "w" => Some(Self::WRITE),
            "exec" | "execute" | "x" => Some(Self::EXEC),
            _ => None,
        }
    }
}
