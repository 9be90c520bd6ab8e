#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
}

/// Commands whose argument is the generation prompt.
pub(crate) const PROMPT_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "generate",
        action: "generate_image",
    },
    CommandSpec {
        command: "edit",
        action: "edit_image",
    },
    CommandSpec {
        command: "video",
        action: "text_to_video",
    },
    CommandSpec {
        command: "animate",
        action: "image_to_video",
    },
    CommandSpec {
        command: "fuse",
        action: "fuse_images",
    },
];

#[derive(Clone, Copy, Debug)]
pub(crate) struct SettingSpec {
    pub command: &'static str,
    pub key: &'static str,
    pub numeric: bool,
}

pub(crate) const SETTING_COMMANDS: &[SettingSpec] = &[
    SettingSpec {
        command: "count",
        key: "count",
        numeric: true,
    },
    SettingSpec {
        command: "resolution",
        key: "resolution",
        numeric: false,
    },
    SettingSpec {
        command: "aspect",
        key: "aspect_ratio",
        numeric: false,
    },
    SettingSpec {
        command: "frames",
        key: "num_frames",
        numeric: true,
    },
    SettingSpec {
        command: "fps",
        key: "frames_per_second",
        numeric: true,
    },
];

pub(crate) const SINGLE_PATH_COMMANDS: &[CommandSpec] = &[CommandSpec {
    command: "upload",
    action: "upload",
}];

pub(crate) const THREAD_COMMAND: CommandSpec = CommandSpec {
    command: "thread",
    action: "set_thread",
};

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "reset",
        action: "reset",
    },
    CommandSpec {
        command: "history",
        action: "history",
    },
    CommandSpec {
        command: "help",
        action: "help",
    },
];

pub const CHAT_HELP_COMMANDS: &[&str] = &[
    "/generate",
    "/edit",
    "/video",
    "/animate",
    "/fuse",
    "/upload",
    "/count",
    "/resolution",
    "/aspect",
    "/frames",
    "/fps",
    "/thread",
    "/reset",
    "/history",
    "/help",
];
