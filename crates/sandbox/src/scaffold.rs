//! Scaffold file generators
//!
//! Pure functions producing the files every sandbox starts from. None of
//! them touch the filesystem; [`crate::lifecycle`] writes the results.

/// Page-side callback fired after a hot update was applied.
pub const HOT_SUCCESS_BINDING: &str = "__sandboxHotSuccess";

/// Page-side callback fired when the hot-update consumer reports an error.
pub const HOT_ERROR_BINDING: &str = "__sandboxHotError";

/// File name of the hot-update status hooks, relative to the sandbox root.
pub const HOOKS_FILE: &str = "sandbox-hooks.cjs";

/// HTML shell served from the public directory.
pub fn index_html(port: u16) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <title>Sandbox</title>
  </head>
  <body>
    <main id="app"></main>
    <script src="http://localhost:{port}/main.js"></script>
  </body>
</html>
"#
    )
}

/// Package manifest placed in the source directory.
pub fn package_json(es_module: bool) -> String {
    let module_type = if es_module { "module" } else { "commonjs" };
    format!(
        r#"{{
  "name": "sandbox",
  "version": "0.0.0",
  "private": true,
  "type": "{module_type}"
}}
"#
    )
}

/// Default entry, written only when the seed files do not provide one.
///
/// Pulls every source module into the graph and accepts updates at the root
/// so edits bubble up to a hot update instead of a reload.
pub fn default_entry(es_module: bool) -> String {
    if es_module {
        r#"const modules = import.meta.webpackContext('./', { recursive: true, regExp: /\.m?js$/ });
modules.keys().forEach(modules);
if (import.meta.webpackHot) {
  import.meta.webpackHot.accept();
}
"#
        .to_string()
    } else {
        r#"const modules = require.context('./', true, /\.c?js$/);
modules.keys().forEach(modules);
if (module.hot) {
  module.hot.accept();
}
"#
        .to_string()
    }
}

/// Status hooks bundled ahead of the entry; they call back into the harness.
pub fn hot_hooks() -> String {
    format!(
        r#"if (module.hot) {{
  module.hot.addStatusHandler(function (status) {{
    if (status === 'idle' && typeof window.{success} === 'function') {{
      window.{success}();
    }}
    if ((status === 'fail' || status === 'abort') && typeof window.{error} === 'function') {{
      window.{error}('Hot update ' + status);
    }}
  }});
}}
"#,
        success = HOT_SUCCESS_BINDING,
        error = HOT_ERROR_BINDING,
    )
}

/// Dev server configuration written at the sandbox root.
pub fn webpack_config(es_module: bool) -> String {
    let entry = if es_module { "./src/index.mjs" } else { "./src/index.js" };
    format!(
        r#"const path = require('path');

module.exports = {{
  mode: 'development',
  context: __dirname,
  devtool: false,
  entry: ['./{hooks}', '{entry}'],
  output: {{
    path: path.join(__dirname, 'dist'),
    filename: 'main.js',
  }},
  devServer: {{
    hot: true,
    liveReload: true,
    client: {{ overlay: false }},
    static: {{ directory: path.join(__dirname, 'public') }},
  }},
}};
"#,
        hooks = HOOKS_FILE,
    )
}

/// Entry file name inside the source directory.
pub fn entry_file(es_module: bool) -> &'static str {
    if es_module {
        "index.mjs"
    } else {
        "index.js"
    }
}
