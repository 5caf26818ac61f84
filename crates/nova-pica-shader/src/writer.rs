/// Indentation-tracking text buffer. Each scope level indents by four spaces.
#[derive(Debug, Default)]
pub(crate) struct ShaderWriter {
    source: String,
    pub(crate) scope: usize,
}

impl ShaderWriter {
    pub(crate) fn add_line(&mut self, text: impl AsRef<str>) {
        let text = text.as_ref();
        if !text.is_empty() {
            self.source.push_str(&" ".repeat(self.scope * 4));
        }
        self.source.push_str(text);
        self.add_new_line();
    }

    pub(crate) fn add_new_line(&mut self) {
        self.source.push('\n');
    }

    pub(crate) fn open(&mut self, text: impl AsRef<str>) {
        self.add_line(text);
        self.scope += 1;
    }

    pub(crate) fn close(&mut self, text: impl AsRef<str>) {
        self.scope = self.scope.saturating_sub(1);
        self.add_line(text);
    }

    pub(crate) fn into_source(self) -> String {
        self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_scopes_indent() {
        let mut w = ShaderWriter::default();
        w.open("bool f() {");
        w.add_line("return true;");
        w.close("}");
        w.add_line("");
        assert_eq!(w.into_source(), "bool f() {\n    return true;\n}\n\n");
    }
}
