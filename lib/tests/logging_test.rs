mod helpers;

use std::{
    io,
    sync::{Arc, Mutex},
};

use helpers::{arithmetic_language, parser_for};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl io::Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn parse_events_reach_the_subscriber() {
    let buffer = SharedBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("tree_sitter_engine=trace"))
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .finish();

    let language = arithmetic_language();
    let mut parser = parser_for(&language);
    tracing::subscriber::with_default(subscriber, || {
        parser.parse("3 * 4", None).unwrap();
    });

    let output = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
    assert!(output.contains("new_parse"), "{output}");
    assert!(output.contains("shift state:"), "{output}");
    assert!(output.contains("consume character:'3'"), "{output}");
    assert!(output.contains("tree_sitter_engine::lex"), "{output}");
    assert!(output.contains("parse finished"), "{output}");
}
