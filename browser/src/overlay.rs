//! Builder for the in-page feedback overlay.
//!
//! The overlay is a foreign-language payload: one self-contained IIFE with no
//! imports, produced as text and evaluated in the page on connect and after
//! every navigation. The only parameter is the annotation service port. The
//! page side exposes two globals (`__pagebridgeRefreshBadges`,
//! `__pagebridgeSetProcessingState`) and guards against double-injection with
//! `__pagebridgeOverlay`.

const PORT_TOKEN: &str = "__PAGEBRIDGE_PORT__";

/// Render the overlay script for the given annotation service port.
pub fn build_overlay_script(port: u16) -> String {
    OVERLAY_TEMPLATE.replace(PORT_TOKEN, &port.to_string())
}

const OVERLAY_TEMPLATE: &str = r#"(() => {
  if (window.__pagebridgeOverlay) {
    if (typeof window.__pagebridgeRefreshBadges === 'function') {
      window.__pagebridgeRefreshBadges();
    }
    return;
  }
  window.__pagebridgeOverlay = true;

  const PORT = __PAGEBRIDGE_PORT__;
  const BASE = 'http://localhost:' + PORT;
  const ROOT_ATTR = 'data-pagebridge-ui';

  const root = document.createElement('div');
  root.setAttribute(ROOT_ATTR, '');
  root.style.cssText = 'position:fixed;z-index:2147483646;top:0;left:0;width:0;height:0;';
  (document.body || document.documentElement).appendChild(root);

  let annotateMode = false;
  let badges = [];

  const toggle = document.createElement('button');
  toggle.setAttribute(ROOT_ATTR, '');
  toggle.textContent = '📌';
  toggle.title = 'Pin feedback on an element';
  toggle.style.cssText =
    'position:fixed;right:16px;bottom:16px;z-index:2147483647;width:40px;height:40px;' +
    'border-radius:20px;border:none;background:#1a73e8;color:#fff;cursor:pointer;' +
    'font-size:18px;box-shadow:0 2px 8px rgba(0,0,0,.3);';
  toggle.addEventListener('click', () => {
    annotateMode = !annotateMode;
    toggle.style.background = annotateMode ? '#d93025' : '#1a73e8';
    document.documentElement.style.cursor = annotateMode ? 'crosshair' : '';
  });
  root.appendChild(toggle);

  const sendBtn = document.createElement('button');
  sendBtn.setAttribute(ROOT_ATTR, '');
  sendBtn.textContent = 'Send';
  sendBtn.style.cssText =
    'position:fixed;right:64px;bottom:16px;z-index:2147483647;height:40px;padding:0 14px;' +
    'border-radius:20px;border:none;background:#188038;color:#fff;cursor:pointer;display:none;';
  sendBtn.addEventListener('click', async () => {
    try {
      await fetch(BASE + '/annotations/send', { method: 'POST' });
      setProcessingState('processing');
    } catch (e) {
      console.warn('pagebridge: send failed', e);
    }
  });
  root.appendChild(sendBtn);

  const statusChip = document.createElement('div');
  statusChip.setAttribute(ROOT_ATTR, '');
  statusChip.style.cssText =
    'position:fixed;right:16px;bottom:64px;z-index:2147483647;padding:4px 10px;border-radius:12px;' +
    'background:#202124;color:#fff;font:12px system-ui;display:none;';
  root.appendChild(statusChip);

  function setProcessingState(state) {
    if (state === 'processing') {
      statusChip.textContent = 'Working on your feedback…';
      statusChip.style.display = 'block';
    } else if (state === 'done') {
      statusChip.textContent = 'Done';
      statusChip.style.display = 'block';
      setTimeout(() => {
        statusChip.style.display = 'none';
        setProcessingState('idle');
      }, 2500);
    } else {
      statusChip.style.display = 'none';
    }
  }

  function cssPath(el) {
    if (el.id) return { selector: '#' + CSS.escape(el.id), confidence: 'stable' };
    const parts = [];
    let node = el;
    while (node && node.nodeType === 1 && parts.length < 6) {
      let part = node.tagName.toLowerCase();
      const stable = Array.from(node.classList).filter(c => !/\d|^(css|sc|jsx)-/.test(c));
      if (stable.length) part += '.' + stable.slice(0, 2).map(CSS.escape).join('.');
      const parent = node.parentElement;
      if (parent) {
        const siblings = Array.from(parent.children).filter(c => c.tagName === node.tagName);
        if (siblings.length > 1) part += ':nth-of-type(' + (siblings.indexOf(node) + 1) + ')';
      }
      parts.unshift(part);
      node = parent;
    }
    const selector = parts.join(' > ');
    let confidence = 'fragile';
    try {
      if (document.querySelectorAll(selector).length === 1) confidence = 'stable';
    } catch (e) { /* malformed selector stays fragile */ }
    return { selector, confidence };
  }

  function reactSource(el) {
    for (const key of Object.keys(el)) {
      if (key.startsWith('__reactFiber$')) {
        let fiber = el[key];
        while (fiber) {
          const type = fiber.type;
          if (typeof type === 'function' && type.name) {
            const src = fiber._debugSource;
            return {
              component: type.name,
              source: src ? src.fileName + ':' + src.lineNumber : undefined,
            };
          }
          fiber = fiber.return;
        }
      }
    }
    return null;
  }

  function describe(el) {
    const rect = el.getBoundingClientRect();
    const { selector, confidence } = cssPath(el);
    return {
      selector,
      selectorConfidence: confidence,
      rect: { x: rect.x, y: rect.y, width: rect.width, height: rect.height },
    };
  }

  async function createAnnotation(el, text) {
    const described = describe(el);
    const body = {
      url: location.href,
      selector: described.selector,
      selectorConfidence: described.selectorConfidence,
      text,
      viewport: { width: window.innerWidth, height: window.innerHeight },
      elementRect: described.rect,
      elements: [described],
      anchorPoint: {
        x: described.rect.x + described.rect.width / 2,
        y: described.rect.y + described.rect.height / 2,
      },
    };
    const source = reactSource(el);
    if (source) body.reactSource = source;
    const resp = await fetch(BASE + '/annotations', {
      method: 'POST',
      headers: { 'Content-Type': 'application/json' },
      body: JSON.stringify(body),
    });
    if (!resp.ok) {
      const err = await resp.json().catch(() => ({}));
      alert('pagebridge: ' + (err.error || 'could not save annotation'));
      return;
    }
    await refreshBadges();
  }

  document.addEventListener('click', (e) => {
    if (!annotateMode) return;
    const el = e.target;
    if (!el || el.closest('[' + ROOT_ATTR + ']')) return;
    e.preventDefault();
    e.stopPropagation();
    const text = prompt('Feedback for this element:');
    if (text) createAnnotation(el, text);
    annotateMode = false;
    toggle.style.background = '#1a73e8';
    document.documentElement.style.cursor = '';
  }, true);

  function clearBadges() {
    for (const b of badges) b.remove();
    badges = [];
  }

  async function refreshBadges() {
    let items = [];
    try {
      const resp = await fetch(BASE + '/annotations');
      items = await resp.json();
    } catch (e) {
      return;
    }
    clearBadges();
    const open = items.filter(a => a.status === 'open' && a.url === location.href);
    sendBtn.style.display = open.length ? 'block' : 'none';
    open.forEach((a, i) => {
      let x = a.anchorPoint ? a.anchorPoint.x : 24;
      let y = a.anchorPoint ? a.anchorPoint.y : 24 + i * 28;
      const badge = document.createElement('div');
      badge.setAttribute(ROOT_ATTR, '');
      badge.textContent = String(i + 1);
      badge.title = a.text;
      badge.dataset.annotationId = a.id;
      badge.style.cssText =
        'position:fixed;z-index:2147483647;left:' + (x - 10) + 'px;top:' + (y - 10) + 'px;' +
        'width:20px;height:20px;border-radius:10px;background:#d93025;color:#fff;' +
        'font:12px/20px system-ui;text-align:center;cursor:pointer;';
      badge.addEventListener('click', async () => {
        if (confirm('Remove this annotation?')) {
          await fetch(BASE + '/annotations/' + a.id, { method: 'DELETE' });
          refreshBadges();
        }
      });
      root.appendChild(badge);
      badges.push(badge);
    });
  }

  window.__pagebridgeRefreshBadges = refreshBadges;
  window.__pagebridgeSetProcessingState = setProcessingState;

  refreshBadges();
})();
"#;
