pub mod chat_response;
pub mod clarify_question;
pub mod computer_autopilot;
pub mod memory_save;
pub mod reminder_create;
pub mod report;
pub mod shell;
pub mod web_research;
