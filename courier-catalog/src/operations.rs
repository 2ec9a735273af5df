//! Standard mail operations shared by every catalog backend.

use crate::descriptor::{
    OperationCategory, OperationDescriptor, ParamKind, ParameterSchema, RiskLevel,
};

pub const SEARCH_MESSAGES: &str = "search_messages";
pub const READ_MESSAGE: &str = "read_message";
pub const ARCHIVE_MESSAGE: &str = "archive_message";
pub const ARCHIVE_THREAD: &str = "archive_thread";
pub const TRASH_MESSAGE: &str = "trash_message";
pub const TRASH_THREAD: &str = "trash_thread";
pub const DELETE_FOREVER: &str = "delete_forever";
pub const MARK_READ: &str = "mark_read";
pub const APPLY_LABEL: &str = "apply_label";
pub const CREATE_DRAFT: &str = "create_draft";
pub const UPDATE_DRAFT: &str = "update_draft";
pub const SEND_DRAFT: &str = "send_draft";
pub const SEND_EMAIL: &str = "send_email";

pub const DELETE_PHRASE: &str = "DELETE FOREVER";
pub const SEND_PHRASE: &str = "SEND";

const MAIL_BATCH_SIZE: usize = 25;

fn message_id_schema() -> ParameterSchema {
    ParameterSchema::new().required("message_id", ParamKind::ItemId, "Message id.")
}

fn thread_id_schema() -> ParameterSchema {
    ParameterSchema::new().required("thread_id", ParamKind::ItemId, "Thread id.")
}

fn compose_schema() -> ParameterSchema {
    ParameterSchema::new()
        .required("to", ParamKind::Email, "Recipient address.")
        .required("subject", ParamKind::String, "Subject line.")
        .required("body", ParamKind::String, "Plain-text body.")
}

pub fn mail_operations() -> Vec<OperationDescriptor> {
    vec![
        OperationDescriptor::new(
            SEARCH_MESSAGES,
            "Search messages with a mail query.",
            OperationCategory::Search,
            RiskLevel::Safe,
            ParameterSchema::new().required("query", ParamKind::String, "Mail search query."),
        ),
        OperationDescriptor::new(
            READ_MESSAGE,
            "Read one message.",
            OperationCategory::Search,
            RiskLevel::Safe,
            message_id_schema(),
        ),
        OperationDescriptor::new(
            ARCHIVE_MESSAGE,
            "Remove a message from the inbox.",
            OperationCategory::Organize,
            RiskLevel::BulkCapable,
            message_id_schema(),
        )
        .with_max_batch_size(MAIL_BATCH_SIZE),
        OperationDescriptor::new(
            ARCHIVE_THREAD,
            "Remove every message of a thread from the inbox.",
            OperationCategory::Organize,
            RiskLevel::Reversible,
            thread_id_schema(),
        ),
        OperationDescriptor::new(
            TRASH_MESSAGE,
            "Move a message to the trash.",
            OperationCategory::Delete,
            RiskLevel::BulkCapable,
            message_id_schema(),
        )
        .with_max_batch_size(MAIL_BATCH_SIZE),
        OperationDescriptor::new(
            TRASH_THREAD,
            "Move every message of a thread to the trash.",
            OperationCategory::Delete,
            RiskLevel::Reversible,
            thread_id_schema(),
        ),
        OperationDescriptor::new(
            DELETE_FOREVER,
            "Permanently delete a message, bypassing the trash.",
            OperationCategory::Delete,
            RiskLevel::Irreversible,
            message_id_schema(),
        )
        .with_max_batch_size(MAIL_BATCH_SIZE)
        .with_confirmation_phrase(DELETE_PHRASE),
        OperationDescriptor::new(
            MARK_READ,
            "Mark a message as read.",
            OperationCategory::Organize,
            RiskLevel::BulkCapable,
            message_id_schema(),
        )
        .with_max_batch_size(MAIL_BATCH_SIZE),
        OperationDescriptor::new(
            APPLY_LABEL,
            "Apply a label to a message.",
            OperationCategory::Organize,
            RiskLevel::BulkCapable,
            message_id_schema().required("label", ParamKind::String, "Label name."),
        )
        .with_max_batch_size(MAIL_BATCH_SIZE),
        OperationDescriptor::new(
            CREATE_DRAFT,
            "Create a draft without sending it.",
            OperationCategory::Compose,
            RiskLevel::Reversible,
            compose_schema(),
        ),
        OperationDescriptor::new(
            UPDATE_DRAFT,
            "Replace the contents of an existing draft.",
            OperationCategory::Compose,
            RiskLevel::Reversible,
            compose_schema().required("draft_id", ParamKind::ItemId, "Draft id."),
        ),
        OperationDescriptor::new(
            SEND_DRAFT,
            "Send an existing draft.",
            OperationCategory::Compose,
            RiskLevel::Irreversible,
            ParameterSchema::new().required("draft_id", ParamKind::ItemId, "Draft id."),
        )
        .with_confirmation_phrase(SEND_PHRASE),
        OperationDescriptor::new(
            SEND_EMAIL,
            "Send a new email immediately.",
            OperationCategory::Compose,
            RiskLevel::Irreversible,
            compose_schema(),
        )
        .with_confirmation_phrase(SEND_PHRASE),
    ]
}
