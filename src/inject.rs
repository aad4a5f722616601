/// Script injected into previewed HTML documents. Forwards console output
/// and runtime errors to the embedding window via `postMessage` so the
/// preview UI can observe the application without modifying its source.
pub const INSTRUMENTATION_SNIPPET: &str = r#"<script>
(function () {
  function post(payload) {
    try { window.parent.postMessage(payload, '*'); } catch (e) {}
  }
  function render(value) {
    try {
      if (typeof value === 'object' && value !== null) { return JSON.stringify(value); }
      return String(value);
    } catch (e) { return String(value); }
  }
  ['log', 'error', 'warn'].forEach(function (method) {
    var original = console[method];
    console[method] = function () {
      var args = Array.prototype.slice.call(arguments);
      post({
        type: 'console',
        level: method === 'warn' ? 'warning' : method,
        message: args.map(render).join(' ')
      });
      return original.apply(console, args);
    };
  });
  window.addEventListener('error', function (event) {
    post({
      type: 'preview-error',
      message: event.message,
      source: event.filename,
      line: event.lineno,
      column: event.colno
    });
  });
  window.addEventListener('unhandledrejection', function (event) {
    var reason = event.reason;
    post({
      type: 'preview-error',
      message: reason && reason.message ? reason.message : String(reason)
    });
  });
})();
</script>"#;

const CLOSING_BODY_TAG: &str = "</body>";

/// A path gets instrumentation when its response is expected to be an HTML
/// document: explicit `.html` files, the root, and directory indexes.
pub fn is_injectable_path(path: &str) -> bool {
    path == "/" || path.ends_with('/') || path.ends_with(".html")
}

/// Rewrite an HTML body to carry the instrumentation snippet, inserted
/// immediately before the closing body tag when one exists, appended
/// otherwise. The body must decode as UTF-8 text; on failure the caller
/// returns a 500 rather than serving unpatched content.
pub fn inject_instrumentation(body: &[u8]) -> Result<String, std::str::Utf8Error> {
    let text = std::str::from_utf8(body)?;
    let mut out = String::with_capacity(text.len() + INSTRUMENTATION_SNIPPET.len());
    match text.find(CLOSING_BODY_TAG) {
        Some(idx) => {
            out.push_str(&text[..idx]);
            out.push_str(INSTRUMENTATION_SNIPPET);
            out.push_str(&text[idx..]);
        }
        None => {
            out.push_str(text);
            out.push_str(INSTRUMENTATION_SNIPPET);
        }
    }
    Ok(out)
}
