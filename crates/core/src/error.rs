/// Errors raised while lowering a [`crate::LibraryDefinition`] into compiled trees.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    /// Two trees in the library share a name.
    #[error("duplicate tree name '{0}'")]
    DuplicateTree(String),

    /// Two states, or two named nodes, in one tree share a name.
    #[error("{tree}: duplicate {kind} name '{name}'")]
    DuplicateName {
        tree: String,
        kind: &'static str,
        name: String,
    },

    /// A transition or task refers to a state that does not exist.
    #[error("{tree}: state '{from}' refers to unknown state '{target}'")]
    UnknownState {
        tree: String,
        from: String,
        target: String,
    },

    /// A `Linked` state names a subtree that is missing or is not a subtree root.
    #[error("{tree}: linked state '{state}' refers to '{subtree}', which is not a subtree")]
    UnknownSubtree {
        tree: String,
        state: String,
        subtree: String,
    },

    /// A `LinkedAsset` state names a tree that is not in the library.
    #[error("{tree}: state '{state}' links unknown asset '{asset}'")]
    UnknownAsset {
        tree: String,
        state: String,
        asset: String,
    },

    /// A linked state is missing its target.
    #[error("{tree}: linked state '{state}' has no link target")]
    MissingLinkTarget { tree: String, state: String },

    /// `NextState` used on a state without a next sibling.
    #[error("{tree}: state '{state}' has no next sibling to transition to")]
    NoNextState { tree: String, state: String },

    #[error("{tree}: too many states")]
    TooManyStates { tree: String },

    /// State nesting exceeds the active-state capacity of a frame.
    #[error("{tree}: state '{state}' is nested deeper than {max} levels")]
    TooDeep {
        tree: String,
        state: String,
        max: usize,
    },

    #[error("{tree}: '{owner}' has more than {max} tasks")]
    TooManyTasks {
        tree: String,
        owner: String,
        max: usize,
    },

    /// Expression nesting exceeds the evaluator's fixed stack.
    #[error("{tree}: '{owner}' uses indent {indent}, the maximum is {max}")]
    BadIndent {
        tree: String,
        owner: String,
        indent: u8,
        max: usize,
    },

    /// A binding source path does not resolve.
    #[error("{tree}: cannot resolve binding source '{path}' for '{owner}'")]
    UnknownBindingSource {
        tree: String,
        owner: String,
        path: String,
    },

    /// A binding target field is not part of the target struct.
    #[error("{tree}: '{owner}' has no field '{field}' to bind")]
    UnknownField {
        tree: String,
        owner: String,
        field: String,
    },
}
