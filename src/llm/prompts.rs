use std::fmt::Write as _;

use crate::backend::ResolveQuery;
use crate::types::page::ActionKind;

pub const SUPPORTED_ACTIONS: &[ActionKind] = &[
    ActionKind::Click,
    ActionKind::Type,
    ActionKind::Select,
    ActionKind::Hover,
    ActionKind::Press,
    ActionKind::ScrollIntoView,
];

fn supported_actions_list() -> String {
    SUPPORTED_ACTIONS
        .iter()
        .map(ActionKind::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

fn build_user_instructions_string(user_instructions: Option<&str>) -> Option<String> {
    let instructions = user_instructions?.trim();
    if instructions.is_empty() {
        return None;
    }

    Some(format!(
        "\n\n# Custom Instructions Provided by the User\n\nPlease keep the user's instructions in mind when performing actions. If the user's instructions are not relevant to the current task, ignore them.\n\nUser Instructions:\n{instructions}"
    ))
}

pub fn build_act_system_prompt(user_instructions: Option<&str>) -> String {
    let base = format!(
        "You are helping the user automate the browser by finding the element an instruction refers to.\n\nYou will be given:\n1. an instruction describing one action\n2. a numbered list of candidate elements from the current page\n\nRemember that to users, buttons and links look the same in most cases. Only pick candidates from the list. If nothing on the page fits the instruction, return an empty `matches` array.\n\nRespond with JSON: return an object with a `matches` array. Each match is an object with keys `candidateId` (the number in brackets), `operation` (one of: {}), `arguments` (an array of strings, for example the text to type or the key to press), `confidence` (a number between 0 and 1) and `description` (a short summary of the action).",
        supported_actions_list()
    );

    match build_user_instructions_string(user_instructions) {
        Some(extra) => format!("{base}{extra}"),
        None => base,
    }
}

/// Render the candidate list the act prompt grounds against.
pub fn render_candidates(query: &ResolveQuery<'_>) -> String {
    let mut rendered = String::new();
    for candidate in query.candidates {
        let _ = write!(
            rendered,
            "[{}] {} <{}>",
            candidate.id, candidate.role, candidate.tag
        );
        if !candidate.visible_text.is_empty() {
            let _ = write!(rendered, " \"{}\"", candidate.visible_text);
        }
        for key in ["href", "placeholder", "name", "type", "value"] {
            if let Some(value) = candidate.attributes.get(key) {
                let _ = write!(rendered, " {key}=\"{value}\"");
            }
        }
        if !candidate.visible {
            rendered.push_str(" (hidden)");
        }
        rendered.push('\n');
    }
    rendered
}

pub fn build_act_user_message(query: &ResolveQuery<'_>) -> String {
    let mut message = format!("instruction: {}", query.instruction);
    if let Some(kind) = query.action_kind {
        let _ = write!(message, "\noperation: {kind}");
    }
    if let Some(hint) = query.selector_hint {
        let _ = write!(message, "\nselector hint: {hint}");
    }
    if !query.variable_names.is_empty() {
        message.push_str("\n\nAvailable variables (use them verbatim in arguments):");
        for name in query.variable_names {
            let _ = write!(message, "\n- %{name}%");
        }
    }
    let _ = write!(message, "\n\nCandidates:\n{}", render_candidates(query));
    message
}

pub fn build_extract_system_prompt(
    is_using_text_extract: bool,
    user_instructions: Option<&str>,
) -> String {
    let content_detail = if is_using_text_extract {
        "A text representation of a webpage to extract information from."
    } else {
        "A list of DOM elements to extract from."
    };

    let mut parts = vec![
        format!(
            "You are extracting content on behalf of a user.\nIf a user asks you to extract a 'list' of information, or 'all' information,\nYOU MUST EXTRACT ALL OF THE INFORMATION THAT THE USER REQUESTS.\n\nYou will be given:\n1. An instruction\n2. {content_detail}"
        ),
        format!(
            "Print the exact text from the {} with all symbols, characters, and endlines as is.\nPrint null or an empty string if no new information is found.",
            if is_using_text_extract {
                "text-rendered webpage"
            } else {
                "DOM elements"
            }
        ),
        "Respond with JSON: your entire reply must be valid JSON that matches the requested schema.".to_string(),
    ];

    if !is_using_text_extract {
        parts.push(
            "If a user is attempting to extract links or URLs, you MUST respond with ONLY the IDs of the link elements, as written in the content.\nDo not attempt to extract links directly from the text unless absolutely necessary."
                .to_string(),
        );
    }

    if let Some(extra) = build_user_instructions_string(user_instructions) {
        parts.push(extra);
    }

    parts.join("\n\n")
}

pub fn build_extract_user_prompt(instruction: &str, content: &str) -> String {
    format!("Instruction: {instruction}\nPage content:\n{content}")
}
