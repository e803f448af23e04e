/// Telegram update handlers and the handler tree
pub mod handlers;
/// Telegram calls with retry
pub mod resilient;
/// `ChatTransport` over teloxide
pub mod transport;

pub use transport::TelegramTransport;
