//! Minimal browser window for running the sandbox document headlessly.
//!
//! Provides just enough DOM for the inline handler: a node tree with
//! attributes and inline styles, `window.parent.postMessage` into an
//! outbox, message delivery tagged by source window, capture-phase click
//! dispatch, `ResizeObserver` driven by a fixed line-height layout, and
//! zero-delay timers run on each settle.

use anyhow::Result;
use rquickjs::{Ctx, Exception, Function};
use serde::Serialize;

use super::processor::fragment_tree;
use super::runtime::QuickJsEngine;

/// Values the shim needs from the document before its scripts run.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShimConfig {
    pub theme: Option<String>,
    pub root_style: Option<String>,
    pub title: Option<String>,
    pub viewport_width: u32,
}

pub fn install(engine: &QuickJsEngine, config: &ShimConfig) -> Result<()> {
    engine.with_context(|ctx| {
        let parse = Function::new(
            ctx.clone(),
            |ctx: Ctx<'_>, markup: String| -> rquickjs::Result<String> {
                match fragment_tree(&markup) {
                    Ok(tree) => Ok(tree.to_string()),
                    Err(err) => Err(Exception::throw_message(&ctx, &err.to_string())),
                }
            },
        )?
        .with_name("__outframe_parse_fragment")?;
        ctx.globals().set("__outframe_parse_fragment", parse)?;
        Ok(())
    })?;

    let config = serde_json::to_string(config)?;
    engine.eval(
        &format!("{WINDOW_SHIM}\n__outframe_install_window({config});"),
        "outframe-window-shim.js",
    )
}

const WINDOW_SHIM: &str = r#"
function __outframe_install_window(config) {
    'use strict';
    var global = globalThis;
    var LINE_HEIGHT = 18;
    var BODY_MARGIN = 16;
    var outbox = [];
    var timers = [];
    var nextTimer = 1;
    var observers = [];

    function EventTarget() {
        this.__listeners = {};
    }
    EventTarget.prototype.addEventListener = function (type, listener, options) {
        var capture = options === true || !!(options && options.capture);
        (this.__listeners[type] = this.__listeners[type] || []).push({ listener: listener, capture: capture });
    };
    EventTarget.prototype.removeEventListener = function (type, listener) {
        var list = this.__listeners[type] || [];
        this.__listeners[type] = list.filter(function (entry) { return entry.listener !== listener; });
    };
    EventTarget.prototype.dispatchEvent = function (event) {
        var list = (this.__listeners[event.type] || []).slice();
        for (var i = 0; i < list.length; i++) {
            try {
                list[i].listener.call(this, event);
            } catch (err) {
                console.error('listener threw: ' + (err && err.message ? err.message : err));
            }
        }
        return !event.defaultPrevented;
    };

    function makeEvent(type, fields) {
        var event = {
            type: type,
            defaultPrevented: false,
            preventDefault: function () { event.defaultPrevented = true; },
            stopPropagation: function () {}
        };
        Object.keys(fields || {}).forEach(function (key) { event[key] = fields[key]; });
        return event;
    }

    function Node(nodeType, nodeName) {
        EventTarget.call(this);
        this.nodeType = nodeType;
        this.nodeName = nodeName;
        this.parentNode = null;
        this.childNodes = [];
    }
    Node.prototype = Object.create(EventTarget.prototype);
    Object.defineProperty(Node.prototype, 'firstChild', {
        get: function () { return this.childNodes.length ? this.childNodes[0] : null; }
    });
    Object.defineProperty(Node.prototype, 'parentElement', {
        get: function () { return this.parentNode && this.parentNode.nodeType === 1 ? this.parentNode : null; }
    });
    Node.prototype.appendChild = function (child) {
        if (child.nodeType === 11) {
            var moved = child.childNodes.slice();
            child.childNodes = [];
            for (var i = 0; i < moved.length; i++) {
                moved[i].parentNode = null;
                this.appendChild(moved[i]);
            }
            return child;
        }
        if (child.parentNode) {
            child.parentNode.removeChild(child);
        }
        child.parentNode = this;
        this.childNodes.push(child);
        return child;
    };
    Node.prototype.removeChild = function (child) {
        var index = this.childNodes.indexOf(child);
        if (index < 0) {
            throw new Error('NotFoundError: node is not a child of this node');
        }
        this.childNodes.splice(index, 1);
        child.parentNode = null;
        return child;
    };
    Object.defineProperty(Node.prototype, 'textContent', {
        get: function () {
            if (this.nodeType === 3) {
                return this.data;
            }
            return this.childNodes.map(function (child) { return child.textContent; }).join('');
        },
        set: function (value) {
            if (this.nodeType === 3) {
                this.data = String(value);
                return;
            }
            this.childNodes.forEach(function (child) { child.parentNode = null; });
            this.childNodes = [];
            var text = value === null || value === undefined ? '' : String(value);
            if (text !== '') {
                this.appendChild(new Text(text));
            }
        }
    });

    function Text(data) {
        Node.call(this, 3, '#text');
        this.data = String(data);
    }
    Text.prototype = Object.create(Node.prototype);

    function Fragment() {
        Node.call(this, 11, '#document-fragment');
    }
    Fragment.prototype = Object.create(Node.prototype);

    function Style(element) {
        this.__element = element;
        this.__properties = {};
    }
    Style.prototype.setProperty = function (name, value) {
        this.__properties[name] = String(value);
        this.__element.__attributes.style = this.cssText;
    };
    Style.prototype.getPropertyValue = function (name) {
        return this.__properties[name] || '';
    };
    Style.prototype.removeProperty = function (name) {
        var previous = this.getPropertyValue(name);
        delete this.__properties[name];
        this.__element.__attributes.style = this.cssText;
        return previous;
    };
    Object.defineProperty(Style.prototype, 'cssText', {
        get: function () {
            var properties = this.__properties;
            return Object.keys(properties).map(function (name) {
                return name + ': ' + properties[name];
            }).join('; ');
        }
    });
    Style.prototype.__parse = function (text) {
        var properties = {};
        String(text || '').split(';').forEach(function (declaration) {
            var colon = declaration.indexOf(':');
            if (colon > 0) {
                properties[declaration.slice(0, colon).trim()] = declaration.slice(colon + 1).trim();
            }
        });
        this.__properties = properties;
    };

    function Element(tag) {
        Node.call(this, 1, String(tag).toUpperCase());
        this.localName = String(tag).toLowerCase();
        this.tagName = this.nodeName;
        this.__attributes = {};
        this.style = new Style(this);
    }
    Element.prototype = Object.create(Node.prototype);
    Element.prototype.setAttribute = function (name, value) {
        name = String(name).toLowerCase();
        this.__attributes[name] = String(value);
        if (name === 'style') {
            this.style.__parse(value);
        }
    };
    Element.prototype.getAttribute = function (name) {
        name = String(name).toLowerCase();
        return Object.prototype.hasOwnProperty.call(this.__attributes, name) ? this.__attributes[name] : null;
    };
    Element.prototype.hasAttribute = function (name) {
        return this.getAttribute(name) !== null;
    };
    Element.prototype.removeAttribute = function (name) {
        delete this.__attributes[String(name).toLowerCase()];
    };
    Object.defineProperty(Element.prototype, 'id', {
        get: function () { return this.getAttribute('id') || ''; },
        set: function (value) { this.setAttribute('id', value); }
    });
    Object.defineProperty(Element.prototype, 'className', {
        get: function () { return this.getAttribute('class') || ''; },
        set: function (value) { this.setAttribute('class', value); }
    });
    Object.defineProperty(Element.prototype, 'href', {
        get: function () { return this.getAttribute('href') || ''; }
    });
    Object.defineProperty(Element.prototype, 'scrollHeight', {
        get: function () {
            if (this === documentElement) {
                return layoutHeight(body) + BODY_MARGIN;
            }
            return layoutHeight(this);
        }
    });
    Object.defineProperty(Element.prototype, 'innerHTML', {
        get: function () {
            return this.childNodes.map(serialize).join('');
        },
        set: function (markup) {
            this.textContent = '';
            this.appendChild(buildFragment(String(markup)));
        }
    });
    Element.prototype.matches = function (selector) {
        var match = /^([a-z0-9-]*)(?:\[([a-z-]+)\])?$/i.exec(String(selector).trim());
        if (!match) {
            return false;
        }
        if (match[1] && match[1].toLowerCase() !== this.localName) {
            return false;
        }
        return !match[2] || this.hasAttribute(match[2]);
    };
    Element.prototype.closest = function (selector) {
        var node = this;
        while (node && node.nodeType === 1) {
            if (node.matches(selector)) {
                return node;
            }
            node = node.parentNode;
        }
        return null;
    };

    var VOID = ['area', 'br', 'col', 'embed', 'hr', 'img', 'input', 'link', 'meta', 'source', 'wbr'];

    function escapeText(text) {
        return String(text).replace(/&/g, '&amp;').replace(/</g, '&lt;').replace(/>/g, '&gt;');
    }

    function serialize(node) {
        if (node.nodeType === 3) {
            return escapeText(node.data);
        }
        var attributes = node.__attributes;
        var open = '<' + node.localName + Object.keys(attributes).map(function (name) {
            return ' ' + name + '="' + escapeText(attributes[name]).replace(/"/g, '&quot;') + '"';
        }).join('') + '>';
        if (VOID.indexOf(node.localName) >= 0) {
            return open;
        }
        return open + node.childNodes.map(serialize).join('') + '</' + node.localName + '>';
    }

    function layoutHeight(node) {
        if (node.nodeType === 3) {
            return node.data === '' ? 0 : node.data.split('\n').length * LINE_HEIGHT;
        }
        if (node.localName === 'style' || node.localName === 'script') {
            return 0;
        }
        if (node.localName === 'img') {
            return Number(node.getAttribute('height')) || 150;
        }
        return node.childNodes.reduce(function (sum, child) { return sum + layoutHeight(child); }, 0);
    }

    function buildNode(desc) {
        if (typeof desc.text === 'string') {
            return new Text(desc.text);
        }
        var element = new Element(desc.tag);
        Object.keys(desc.attrs || {}).forEach(function (name) {
            element.setAttribute(name, desc.attrs[name]);
        });
        (desc.children || []).forEach(function (child) {
            element.appendChild(buildNode(child));
        });
        return element;
    }

    function buildFragment(markup) {
        var fragment = new Fragment();
        JSON.parse(global.__outframe_parse_fragment(markup)).forEach(function (desc) {
            fragment.appendChild(buildNode(desc));
        });
        return fragment;
    }

    var document = new Node(9, '#document');
    var documentElement = new Element('html');
    var head = new Element('head');
    var body = new Element('body');
    var root = new Element('div');
    root.setAttribute('id', 'root');
    documentElement.appendChild(head);
    documentElement.appendChild(body);
    body.appendChild(root);
    document.appendChild(documentElement);
    if (config.theme) {
        documentElement.setAttribute('data-theme', config.theme);
    }
    if (config.rootStyle) {
        documentElement.setAttribute('style', config.rootStyle);
    }

    document.documentElement = documentElement;
    document.head = head;
    document.body = body;
    document.title = config.title || '';
    document.createElement = function (tag) { return new Element(tag); };
    document.createTextNode = function (text) { return new Text(text); };
    document.createDocumentFragment = function () { return new Fragment(); };
    document.createRange = function () {
        return {
            selectNodeContents: function () {},
            createContextualFragment: buildFragment
        };
    };
    document.getElementById = function (id) {
        var stack = [documentElement];
        while (stack.length) {
            var node = stack.shift();
            if (node.nodeType === 1 && node.getAttribute('id') === id) {
                return node;
            }
            Array.prototype.push.apply(stack, node.childNodes);
        }
        return null;
    };
    document.querySelectorAll = function (selector) {
        var found = [];
        var stack = [documentElement];
        while (stack.length) {
            var node = stack.shift();
            if (node.nodeType === 1 && node.matches(selector)) {
                found.push(node);
            }
            Array.prototype.push.apply(stack, node.childNodes);
        }
        return found;
    };
    document.querySelector = function (selector) {
        return document.querySelectorAll(selector)[0] || null;
    };

    function structuredClone(value) {
        return value === undefined ? undefined : JSON.parse(JSON.stringify(value));
    }

    var parentWindow = {
        postMessage: function (message) {
            outbox.push(structuredClone(message));
        }
    };
    var foreignWindow = { postMessage: function () {} };

    EventTarget.call(global);
    global.addEventListener = EventTarget.prototype.addEventListener;
    global.removeEventListener = EventTarget.prototype.removeEventListener;
    global.dispatchEvent = EventTarget.prototype.dispatchEvent;
    global.window = global;
    global.self = global;
    global.parent = parentWindow;
    global.top = parentWindow;
    global.document = document;
    global.Node = Node;
    global.Element = Element;
    global.HTMLElement = Element;
    global.Text = Text;
    global.location = { href: 'about:srcdoc', origin: 'null' };
    global.navigator = { userAgent: 'outframe-headless' };

    global.setTimeout = function (callback, delay) {
        var id = nextTimer++;
        var args = Array.prototype.slice.call(arguments, 2);
        timers.push({ id: id, callback: callback, args: args });
        return id;
    };
    global.clearTimeout = function (id) {
        timers = timers.filter(function (timer) { return timer.id !== id; });
    };

    function ResizeObserver(callback) {
        this.callback = callback;
        this.targets = [];
        observers.push(this);
    }
    ResizeObserver.prototype.observe = function (target) {
        this.targets.push({ element: target, height: null });
    };
    ResizeObserver.prototype.unobserve = function (target) {
        this.targets = this.targets.filter(function (entry) { return entry.element !== target; });
    };
    ResizeObserver.prototype.disconnect = function () {
        this.targets = [];
    };
    global.ResizeObserver = ResizeObserver;

    global.__outframe_outbox = outbox;

    global.__outframe_deliver = function (origin, data) {
        var source = origin === 'parent' ? parentWindow : foreignWindow;
        global.dispatchEvent(makeEvent('message', {
            data: structuredClone(data),
            source: source,
            origin: 'null'
        }));
    };

    global.__outframe_click = function (href, newTab) {
        var anchors = document.querySelectorAll('a[href]').filter(function (anchor) {
            return anchor.getAttribute('href') === href;
        });
        if (!anchors.length) {
            return false;
        }
        var target = anchors[0].firstChild && anchors[0].firstChild.nodeType === 1 ? anchors[0].firstChild : anchors[0];
        var event = makeEvent('click', { target: target, button: 0, metaKey: !!newTab, ctrlKey: false, shiftKey: false });
        document.dispatchEvent(event);
        return true;
    };

    global.__outframe_settle = function () {
        var due = timers;
        timers = [];
        due.forEach(function (timer) {
            try {
                timer.callback.apply(null, timer.args);
            } catch (err) {
                global.dispatchEvent(makeEvent('error', { message: String(err && err.message || err), error: err }));
            }
        });
        observers.forEach(function (observer) {
            var entries = [];
            observer.targets.forEach(function (entry) {
                var height = layoutHeight(entry.element);
                if (height !== entry.height) {
                    entry.height = height;
                    entries.push({
                        target: entry.element,
                        contentRect: { width: config.viewportWidth, height: height }
                    });
                }
            });
            if (entries.length) {
                observer.callback(entries, observer);
            }
        });
    };
}
"#;
