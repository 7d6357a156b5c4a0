//! Build recipes and runtime wrappers staged into the build context.

use crate::crd::{Language, LambdaFunctionSpec, Source};

/// Directory (relative to the build context) that holds the function source.
pub const SOURCE_DIR: &str = "src";

/// Numeric uid and gid of every generated image; built services pin the same ids.
pub const RUNTIME_USER: i64 = 65532;

/// One file of the build context. `key` is the ConfigMap key, `path` where it
/// lands relative to the context root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextFile {
    pub key: String,
    pub path: String,
    pub content: String,
}

impl ContextFile {
    fn new(key: impl Into<String>, path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            path: path.into(),
            content: content.into(),
        }
    }
}

/// File the handler module is stored under, e.g. `main.py` for `main.handler`.
pub fn source_filename(language: Language, handler: &str) -> String {
    let module = handler.split('.').next().unwrap_or("main");
    match language {
        Language::Python => format!("{module}.py"),
        Language::Node => format!("{module}.js"),
        Language::Go => "main.go".into(),
    }
}

/// Renders every generated file for a build. Remote sources only get the
/// recipe and wrapper; their code is fetched into [`SOURCE_DIR`] by the task.
pub fn render_context(spec: &LambdaFunctionSpec, source: Source<'_>, language: Language) -> Vec<ContextFile> {
    let handler = spec.runtime.handler();
    let version = spec.runtime.version.trim();
    let subdir = match source {
        Source::Git(git) => git.path.as_deref().unwrap_or_default().trim_matches('/'),
        _ => "",
    };

    let mut files = vec![ContextFile::new(
        "Dockerfile",
        "Dockerfile",
        dockerfile(language, version, handler, subdir),
    )];

    match language {
        Language::Python => files.push(ContextFile::new("runtime.py", "runtime.py", PYTHON_RUNTIME)),
        Language::Node => files.push(ContextFile::new("runtime.js", "runtime.js", NODE_RUNTIME)),
        Language::Go => {}
    }

    if matches!(source, Source::Minio(_) | Source::S3(_) | Source::Gcs(_)) {
        // Fetch steps write into an existing directory.
        files.push(ContextFile::new("keep", format!("{SOURCE_DIR}/.keep"), ""));
    }

    if let Source::Inline(inline) = source {
        let filename = source_filename(language, handler);
        files.push(ContextFile::new(
            "source",
            format!("{SOURCE_DIR}/{filename}"),
            inline.code.clone(),
        ));
        if let Some(deps) = inline.dependencies.as_deref().filter(|d| !d.trim().is_empty()) {
            let manifest = match language {
                Language::Python => "requirements.txt",
                Language::Node => "package.json",
                Language::Go => "go.mod",
            };
            files.push(ContextFile::new(
                "dependencies",
                format!("{SOURCE_DIR}/{manifest}"),
                deps.to_string(),
            ));
        }
    }

    files
}

pub fn dockerfile(language: Language, version: &str, handler: &str, subdir: &str) -> String {
    let src = if subdir.is_empty() {
        format!("{SOURCE_DIR}/")
    } else {
        format!("{SOURCE_DIR}/{subdir}/")
    };

    let uid = RUNTIME_USER;

    match language {
        Language::Python => format!(
            r#"FROM python:{version}-slim
WORKDIR /app
COPY {src} /app/
RUN if [ -f requirements.txt ]; then pip install --no-cache-dir -r requirements.txt; fi
COPY runtime.py /app/runtime.py
ENV HANDLER={handler} PORT=8080 PYTHONUNBUFFERED=1
USER {uid}:{uid}
EXPOSE 8080
CMD ["python", "/app/runtime.py"]
"#
        ),
        Language::Node => format!(
            r#"FROM node:{version}-alpine
WORKDIR /app
COPY {src} /app/
RUN if [ -f package.json ]; then npm install --omit=dev; fi
COPY runtime.js /app/runtime.js
ENV HANDLER={handler} PORT=8080 NODE_ENV=production
USER {uid}:{uid}
EXPOSE 8080
CMD ["node", "/app/runtime.js"]
"#
        ),
        Language::Go => format!(
            r#"FROM golang:{version}-alpine AS build
WORKDIR /src
COPY {src} /src/
RUN if [ ! -f go.mod ]; then go mod init function; fi && go mod tidy && CGO_ENABLED=0 go build -o /out/function .

FROM gcr.io/distroless/static:nonroot
COPY --from=build /out/function /function
ENV PORT=8080
EXPOSE 8080
USER {uid}:{uid}
ENTRYPOINT ["/function"]
"#
        ),
    }
}

const PYTHON_RUNTIME: &str = r#"import importlib
import json
import os
from http.server import BaseHTTPRequestHandler, ThreadingHTTPServer

module_name, func_name = os.environ.get("HANDLER", "main.handler").split(".", 1)
handler = getattr(importlib.import_module(module_name), func_name)


def read_event(req):
    length = int(req.headers.get("Content-Length") or 0)
    body = req.rfile.read(length) if length else b""
    if req.headers.get("Content-Type", "").startswith("application/cloudevents+json"):
        return json.loads(body or b"{}")
    event = {k[3:].lower(): v for k, v in req.headers.items() if k.lower().startswith("ce-")}
    try:
        event["data"] = json.loads(body) if body else None
    except ValueError:
        event["data"] = body.decode("utf-8", "replace")
    return event


class Handler(BaseHTTPRequestHandler):
    def _reply(self, status, payload):
        body = json.dumps(payload).encode()
        self.send_response(status)
        self.send_header("Content-Type", "application/json")
        self.send_header("Content-Length", str(len(body)))
        self.end_headers()
        self.wfile.write(body)

    def do_GET(self):
        if self.path in ("/health", "/ready"):
            self._reply(200, {"status": "ok"})
        else:
            self._reply(404, {"error": "not found"})

    def do_POST(self):
        try:
            result = handler(read_event(self))
            self._reply(200, result if result is not None else {})
        except Exception as exc:
            self._reply(500, {"error": str(exc)})

    def log_message(self, fmt, *args):
        pass


ThreadingHTTPServer(("0.0.0.0", int(os.environ.get("PORT", "8080"))), Handler).serve_forever()
"#;

const NODE_RUNTIME: &str = r#"const http = require("http");
const path = require("path");

const [moduleName, funcName] = (process.env.HANDLER || "main.handler").split(".");
const handler = require(path.join("/app", moduleName))[funcName];

function readEvent(req, body) {
  if ((req.headers["content-type"] || "").startsWith("application/cloudevents+json")) {
    return JSON.parse(body || "{}");
  }
  const event = {};
  for (const [k, v] of Object.entries(req.headers)) {
    if (k.startsWith("ce-")) event[k.slice(3)] = v;
  }
  try {
    event.data = body ? JSON.parse(body) : null;
  } catch (_) {
    event.data = body;
  }
  return event;
}

function reply(res, status, payload) {
  res.writeHead(status, { "Content-Type": "application/json" });
  res.end(JSON.stringify(payload));
}

http
  .createServer((req, res) => {
    if (req.method === "GET") {
      return req.url === "/health" || req.url === "/ready"
        ? reply(res, 200, { status: "ok" })
        : reply(res, 404, { error: "not found" });
    }
    let body = "";
    req.on("data", (chunk) => (body += chunk));
    req.on("end", async () => {
      try {
        const result = await handler(readEvent(req, body));
        reply(res, 200, result === undefined ? {} : result);
      } catch (err) {
        reply(res, 500, { error: String(err) });
      }
    });
  })
  .listen(Number(process.env.PORT || 8080));
"#;
