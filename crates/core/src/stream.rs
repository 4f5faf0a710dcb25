use futures::StreamExt;
use futures::stream::{self, BoxStream};
use tokio::sync::mpsc;

/// A lazy, single-pass sequence of reply text fragments.
pub type TextStream = BoxStream<'static, anyhow::Result<String>>;

/// Turns the receiving half of a channel into a boxed stream that ends once every sender is gone.
pub fn from_receiver<T: Send + 'static>(rx: mpsc::Receiver<T>) -> BoxStream<'static, T> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

/// A text stream that yields one fixed string, used for scripted replies.
pub fn once_text(text: impl Into<String>) -> TextStream {
    stream::once(futures::future::ready(Ok(text.into()))).boxed()
}
