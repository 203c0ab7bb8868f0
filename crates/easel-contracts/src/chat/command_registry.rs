#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
    pub arg_key: &'static str,
}

pub(crate) const RAW_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "provider",
        action: "set_provider",
        arg_key: "provider",
    },
    CommandSpec {
        command: "aspect",
        action: "set_aspect_ratio",
        arg_key: "aspect_ratio",
    },
    CommandSpec {
        command: "tier",
        action: "set_model_tier",
        arg_key: "tier",
    },
    CommandSpec {
        command: "new",
        action: "new_session",
        arg_key: "name",
    },
    CommandSpec {
        command: "rename",
        action: "rename_session",
        arg_key: "name",
    },
    CommandSpec {
        command: "switch",
        action: "switch_session",
        arg_key: "session_id",
    },
    CommandSpec {
        command: "delete",
        action: "delete_session",
        arg_key: "session_id",
    },
];

/// Commands whose argument is the prompt for a request of the same name.
pub(crate) const PROMPT_COMMANDS: &[&str] = &[
    "generate",
    "edit",
    "analyze",
    "chat",
    "vectorize",
    "video",
];

pub(crate) const TOGGLE_COMMANDS: &[&str] = &["auto_download", "web_search"];

pub(crate) const SINGLE_PATH_COMMANDS: &[CommandSpec] = &[CommandSpec {
    command: "use",
    action: "set_active_image",
    arg_key: "path",
}];

pub(crate) const MULTI_PATH_COMMANDS: &[CommandSpec] = &[CommandSpec {
    command: "blend",
    action: "blend",
    arg_key: "paths",
}];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "sessions",
        action: "list_sessions",
        arg_key: "",
    },
    CommandSpec {
        command: "migrate",
        action: "migrate",
        arg_key: "",
    },
    CommandSpec {
        command: "help",
        action: "help",
        arg_key: "",
    },
];

pub const CHAT_HELP_COMMANDS: &[&str] = &[
    "/generate",
    "/edit",
    "/blend",
    "/analyze",
    "/chat",
    "/vectorize",
    "/video",
    "/use",
    "/provider",
    "/tier",
    "/aspect",
    "/multiplier",
    "/auto_download",
    "/web_search",
    "/new",
    "/rename",
    "/switch",
    "/delete",
    "/sessions",
    "/migrate",
    "/help",
];
